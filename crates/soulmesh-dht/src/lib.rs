//! Soulmesh DHT Rendezvous
//!
//! Lets nodes find each other without a central directory. Each node
//! publishes a signed [`PeerDescriptor`] keyed by its peer id and resolves
//! other peers' descriptors the same way.
//!
//! # Design
//!
//! Keys are 32-byte Blake3 hashes. Storage is behind the small
//! [`Rendezvous`] trait (`put`, `get`, `bootstrap`) so the DHT itself is
//! pluggable. [`OverlayRendezvous`] is the default: it replicates records to
//! the XOR-closest overlay neighbors and queries them on a local miss.
//!
//! # Conflict Resolution
//!
//! Entries carry a write timestamp and an expiry. The newest live entry wins;
//! an expired entry never blocks a fresh write.
//!
//! All DHT work is best-effort. Timeouts and unreachable seeds are logged and
//! retried, never surfaced as fatal.

mod descriptor;
mod entry;
mod error;
mod network;
mod publisher;
mod rendezvous;
mod state;

pub use descriptor::{descriptor_key, is_descriptor_record, PeerDescriptor};
pub use entry::{now_ms, DhtEntry, DhtKey, DhtValue};
pub use error::{Error, Result};
pub use network::{OverlayRendezvous, RecordPolicy};
pub use publisher::{Backoff, DescriptorPublisher, PublisherConfig};
pub use rendezvous::{MemoryRendezvous, Rendezvous};
pub use state::{DhtState, DEFAULT_MAX_ENTRIES};

/// Hash a string key to a DHT key using Blake3.
pub fn hash_key(data: &[u8]) -> DhtKey {
    let hash = blake3::hash(data);
    DhtKey(*hash.as_bytes())
}

/// Hash a prefixed key (e.g., "peer:{id}") to a DHT key.
pub fn hash_prefixed_key(prefix: &str, id: &str) -> DhtKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b":");
    hasher.update(id.as_bytes());
    DhtKey(*hasher.finalize().as_bytes())
}

/// The `k` items whose keys are XOR-closest to `target`.
pub fn k_closest<T: Clone>(target: &DhtKey, candidates: &[(DhtKey, T)], k: usize) -> Vec<T> {
    let mut sorted: Vec<&(DhtKey, T)> = candidates.iter().collect();
    sorted.sort_by_key(|(key, _)| key.distance(target));
    sorted.into_iter().take(k).map(|(_, item)| item.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_deterministic() {
        assert_eq!(hash_key(b"hello"), hash_key(b"hello"));
        assert_ne!(hash_key(b"hello"), hash_key(b"world"));
    }

    #[test]
    fn prefixed_key_format() {
        let key1 = hash_prefixed_key("peer", "abc123");
        assert_eq!(key1, hash_prefixed_key("peer", "abc123"));
        assert_ne!(key1, hash_prefixed_key("peer", "different"));
        assert_ne!(key1, hash_prefixed_key("recording", "abc123"));
    }

    #[test]
    fn k_closest_orders_by_xor() {
        let target = DhtKey([0u8; 32]);
        let mut far = [0u8; 32];
        far[0] = 0xFF;
        let mut near = [0u8; 32];
        near[31] = 0x01;
        let mut mid = [0u8; 32];
        mid[10] = 0x01;

        let candidates = vec![
            (DhtKey(far), "far"),
            (DhtKey(near), "near"),
            (DhtKey(mid), "mid"),
        ];
        assert_eq!(k_closest(&target, &candidates, 2), vec!["near", "mid"]);
        assert_eq!(k_closest(&target, &candidates, 10).len(), 3);
    }
}
