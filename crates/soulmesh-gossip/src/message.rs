//! Gossip message envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default hop limit.
pub const DEFAULT_MAX_HOPS: u32 = 3;

/// Default time to live (5 minutes).
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Reliability {
    #[default]
    BestEffort,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GossipMetadata {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub reliability: Reliability,
}

/// A typed, optionally realm-scoped message flooded across neighbors.
///
/// Messages are never mutated once received; forwarding works on a copy
/// from [`GossipMessage::forwarded`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_id: Option<String>,
    /// Creation time, unix milliseconds.
    pub timestamp_ms: u64,
    pub hop_count: u32,
    pub max_hops: u32,
    pub ttl_ms: u64,
    pub originator_peer_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: GossipMetadata,
}

impl GossipMessage {
    pub fn new(
        message_type: impl Into<String>,
        originator_peer_id: impl Into<String>,
        payload: serde_json::Value,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            realm_id: None,
            timestamp_ms,
            hop_count: 0,
            max_hops: DEFAULT_MAX_HOPS,
            ttl_ms: DEFAULT_TTL_MS,
            originator_peer_id: originator_peer_id.into(),
            payload,
            metadata: GossipMetadata::default(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm_id = Some(realm.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.metadata.reliability = reliability;
        self
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Type and originator are both non-empty.
    pub fn is_well_formed(&self) -> bool {
        !self.message_type.trim().is_empty() && !self.originator_peer_id.trim().is_empty()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.timestamp_ms.saturating_add(self.ttl_ms)
    }

    /// Well formed, unexpired, and below the hop limit.
    pub fn can_forward(&self, now_ms: u64) -> bool {
        self.hop_count < self.max_hops && !self.is_expired(now_ms) && self.is_well_formed()
    }

    /// Copy with the hop count incremented.
    pub fn forwarded(&self) -> Self {
        let mut copy = self.clone();
        copy.hop_count = copy.hop_count.saturating_add(1);
        copy
    }

    /// Case-insensitive realm membership.
    pub fn belongs_to_realm(&self, realm: &str) -> bool {
        self.realm_id
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case(realm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg() -> GossipMessage {
        GossipMessage::new("peer-announce", "b3b3/origin", json!({"k": 1}), 1_000)
    }

    #[test]
    fn defaults() {
        let m = msg();
        assert_eq!(m.max_hops, 3);
        assert_eq!(m.ttl_ms, 300_000);
        assert_eq!(m.metadata.priority, Priority::Normal);
        assert_eq!(m.metadata.reliability, Reliability::BestEffort);
    }

    #[test]
    fn hop_bound() {
        let mut m = msg();
        m.hop_count = 2;
        assert!(m.can_forward(1_000));
        m.hop_count = 3;
        assert!(!m.can_forward(1_000));
    }

    #[test]
    fn ttl_bound() {
        let m = msg();
        assert!(m.can_forward(300_999));
        assert!(!m.can_forward(301_000));
        assert!(m.is_expired(301_000));
    }

    #[test]
    fn malformed_never_forwards() {
        let mut m = msg();
        m.originator_peer_id = String::new();
        assert!(!m.can_forward(1_000));
        let mut m = msg();
        m.message_type = "  ".into();
        assert!(!m.is_well_formed());
    }

    #[test]
    fn forwarded_is_a_copy() {
        let original = msg();
        let next = original.forwarded();
        assert_eq!(original.hop_count, 0);
        assert_eq!(next.hop_count, 1);
        assert_eq!(next.id, original.id);
    }

    #[test]
    fn realm_match_ignores_case() {
        let m = msg().with_realm("Jazz");
        assert!(m.belongs_to_realm("jazz"));
        assert!(!m.belongs_to_realm("rock"));
        assert!(!msg().belongs_to_realm("jazz"));
    }

    #[test]
    fn wire_uses_type_field() {
        let json = serde_json::to_value(msg()).unwrap();
        assert_eq!(json["type"], "peer-announce");
        assert!(json.get("realmId").is_none());
        assert_eq!(json["metadata"]["priority"], "Normal");
    }
}
