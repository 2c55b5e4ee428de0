//! Moderation oracle seam. Fails closed.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationVerdict {
    Allowed,
    NonAdvertisable,
    Blocked,
    Quarantined,
}

impl ModerationVerdict {
    pub fn is_advertisable(&self) -> bool {
        matches!(self, ModerationVerdict::Allowed)
    }
}

/// Per content item allow/block decisions.
pub trait ModerationOracle: Send + Sync {
    /// `None` when the item has no verdict on record.
    fn verdict(&self, item_id: &str) -> Option<ModerationVerdict>;

    /// Only an explicit `Allowed` verdict passes.
    fn is_allowed(&self, item_id: &str) -> bool {
        self.verdict(item_id).is_some_and(|v| v.is_advertisable())
    }
}

/// Verdicts held in memory.
#[derive(Default)]
pub struct StaticModeration {
    verdicts: RwLock<HashMap<String, ModerationVerdict>>,
}

impl StaticModeration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, item_id: impl Into<String>, verdict: ModerationVerdict) {
        self.verdicts
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(item_id.into(), verdict);
    }

    pub fn allow(&self, item_id: impl Into<String>) {
        self.set(item_id, ModerationVerdict::Allowed);
    }
}

impl ModerationOracle for StaticModeration {
    fn verdict(&self, item_id: &str) -> Option<ModerationVerdict> {
        self.verdicts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(item_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_verdict_is_excluded() {
        let oracle = StaticModeration::new();
        assert!(!oracle.is_allowed("unknown"));
        oracle.allow("ok");
        oracle.set("bad", ModerationVerdict::Quarantined);
        oracle.set("hidden", ModerationVerdict::NonAdvertisable);
        assert!(oracle.is_allowed("ok"));
        assert!(!oracle.is_allowed("bad"));
        assert!(!oracle.is_allowed("hidden"));
    }
}
