//! Transfer plans and their state machine.
//!
//! ```text
//! Pending ──► Planned ──► Completed
//!    │           ├──────► Failed
//!    │           └──────► Cancelled
//!    ├──────────────────► Failed
//!    └──────────────────► Cancelled
//! ```
//!
//! `Planned` may be re-entered from `Planned` when the resolver re-plans a
//! stalled transfer.

use serde::{Deserialize, Serialize};
use soulmesh_discovery::{ContentDomain, SourceCandidate};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Planned,
    Failed,
    Completed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Failed | PlanStatus::Completed | PlanStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Pending, Planned)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Planned, Planned)
                | (Planned, Completed)
                | (Planned, Failed)
                | (Planned, Cancelled)
        )
    }
}

/// What the caller wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub item_id: String,
    /// Unparsed; planning validates it.
    pub domain: String,
    pub filename: String,
    pub file_size: u64,
    pub recording_id: Option<String>,
    pub fingerprint: Option<String>,
}

impl TransferRequest {
    pub fn new(
        item_id: impl Into<String>,
        domain: impl Into<String>,
        filename: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            domain: domain.into(),
            filename: filename.into(),
            file_size,
            recording_id: None,
            fingerprint: None,
        }
    }

    pub fn with_recording(mut self, recording_id: impl Into<String>) -> Self {
        self.recording_id = Some(recording_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: SourceCandidate,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub id: Uuid,
    pub desired_item_id: String,
    pub domain: Option<ContentDomain>,
    pub status: PlanStatus,
    /// Best first.
    pub ordered_candidates: Vec<RankedCandidate>,
    pub error_message: Option<String>,
    /// Times this plan was rebuilt after its sources ran out.
    pub replans: u32,
}

impl TransferPlan {
    pub fn new(desired_item_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            desired_item_id: desired_item_id.into(),
            domain: None,
            status: PlanStatus::Pending,
            ordered_candidates: Vec::new(),
            error_message: None,
            replans: 0,
        }
    }

    fn transition(&mut self, next: PlanStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(plan = %self.id, from = ?self.status, to = ?next, "Ignored invalid plan transition");
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_planned(&mut self, candidates: Vec<RankedCandidate>) -> bool {
        let replanning = self.status == PlanStatus::Planned;
        if !self.transition(PlanStatus::Planned) {
            return false;
        }
        if replanning {
            self.replans += 1;
        }
        self.ordered_candidates = candidates;
        self.error_message = None;
        true
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if !self.transition(PlanStatus::Failed) {
            return false;
        }
        self.error_message = Some(message);
        true
    }

    pub fn mark_completed(&mut self) -> bool {
        self.transition(PlanStatus::Completed)
    }

    pub fn mark_cancelled(&mut self) -> bool {
        if !self.transition(PlanStatus::Cancelled) {
            return false;
        }
        self.error_message = Some("transfer cancelled".to_string());
        true
    }

    pub fn best(&self) -> Option<&RankedCandidate> {
        self.ordered_candidates.first()
    }
}
