//! Rendezvous over overlay neighbors.
//!
//! Records are stored locally and pushed to the `replication` neighbors whose
//! peer-id hash is XOR-closest to the key. Lookups answer locally when
//! possible, otherwise ask the closest neighbors in parallel and keep the
//! newest live answer. Find requests are answered from local state only, so
//! a lookup never fans out more than one hop.
//!
//! Records from neighbors pass [`RecordPolicy`] before last-write-wins sees
//! them: no timestamps from the future, bounded lifetimes, and by default
//! only signed descriptors stored under their owner's key.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use soulmesh_overlay::{AdmitOutcome, Error as OverlayError, Frame, FrameKind, Overlay};
use tracing::{debug, trace, warn};

use crate::descriptor::is_descriptor_record;
use crate::entry::now_ms;
use crate::error::Result;
use crate::rendezvous::Rendezvous;
use crate::state::DEFAULT_MAX_ENTRIES;
use crate::{hash_key, k_closest, DhtEntry, DhtKey, DhtState, DhtValue};

#[derive(Debug, Serialize, Deserialize)]
struct StoreBody {
    entry: DhtEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct FindBody {
    key: DhtKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct FoundBody {
    entry: Option<DhtEntry>,
}

/// What a record from a neighbor must satisfy to be stored or believed.
#[derive(Debug, Clone)]
pub struct RecordPolicy {
    /// How far a record's timestamp may run ahead of the local clock.
    pub max_clock_skew: Duration,
    /// Longest lifetime granted to a remote record, counted from its timestamp.
    pub max_ttl: Duration,
    pub max_entries: usize,
    /// Accept only verified peer descriptors under their owner's key.
    pub descriptors_only: bool,
}

impl Default for RecordPolicy {
    fn default() -> Self {
        Self {
            max_clock_skew: Duration::from_secs(30),
            max_ttl: Duration::from_secs(60 * 60),
            max_entries: DEFAULT_MAX_ENTRIES,
            descriptors_only: true,
        }
    }
}

impl RecordPolicy {
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_descriptors_only(mut self, enabled: bool) -> Self {
        self.descriptors_only = enabled;
        self
    }

    /// The record as it may be stored, or `None` if it is refused.
    pub fn admit(&self, mut entry: DhtEntry, now_ms: u64) -> Option<DhtEntry> {
        let skew = self.max_clock_skew.as_millis() as u64;
        if entry.timestamp > now_ms.saturating_add(skew) {
            debug!(key = %entry.key, ahead_ms = entry.timestamp - now_ms, "dht record from the future");
            return None;
        }
        let latest_expiry = entry.timestamp.saturating_add(self.max_ttl.as_millis() as u64);
        entry.expires_at = entry.expires_at.min(latest_expiry);
        if entry.is_expired(now_ms) {
            return None;
        }
        if self.descriptors_only && !is_descriptor_record(&entry.key, &entry.value) {
            debug!(key = %entry.key, "dht record is not a valid descriptor");
            return None;
        }
        Some(entry)
    }
}

pub struct OverlayRendezvous {
    overlay: Arc<Overlay>,
    state: Mutex<DhtState>,
    policy: RecordPolicy,
    replication: usize,
    query_timeout: Duration,
}

impl OverlayRendezvous {
    pub fn new(overlay: Arc<Overlay>, replication: usize, query_timeout: Duration) -> Self {
        Self::with_policy(overlay, replication, query_timeout, RecordPolicy::default())
    }

    pub fn with_policy(
        overlay: Arc<Overlay>,
        replication: usize,
        query_timeout: Duration,
        policy: RecordPolicy,
    ) -> Self {
        Self {
            overlay,
            state: Mutex::new(DhtState::with_capacity(policy.max_entries)),
            policy,
            replication: replication.max(1),
            query_timeout,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DhtState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    fn closest_neighbors(&self, key: &DhtKey) -> Vec<String> {
        let peers = self.overlay.registry().peer_ids();
        let keyed: Vec<(DhtKey, String)> = peers.into_iter().map(|p| (hash_key(p.as_bytes()), p)).collect();
        k_closest(key, &keyed, self.replication)
    }

    /// Apply a `DhtStore` frame from a neighbor. Returns true if stored.
    pub fn handle_store(&self, frame: &Frame) -> bool {
        match frame.decode::<StoreBody>() {
            Ok(body) => match self.policy.admit(body.entry, now_ms()) {
                Some(entry) => self.with_state(|s| s.put_entry(entry)),
                None => false,
            },
            Err(e) => {
                debug!("malformed dht store: {}", e);
                false
            }
        }
    }

    /// Answer a `DhtFind` frame from local state.
    pub fn handle_find(&self, frame: &Frame) -> Option<Frame> {
        let body = frame.decode::<FindBody>().ok()?;
        let now = now_ms();
        let entry = self.with_state(|s| s.get(&body.key, now).cloned());
        Frame::new(FrameKind::DhtFound, &FoundBody { entry }).ok()
    }

    /// Drop expired records.
    pub fn prune(&self) -> usize {
        let now = now_ms();
        self.with_state(|s| s.prune_expired(now))
    }

    pub fn local_len(&self) -> usize {
        self.with_state(|s| s.len())
    }
}

#[async_trait]
impl Rendezvous for OverlayRendezvous {
    async fn put(&self, key: DhtKey, value: DhtValue, ttl: Duration) -> Result<usize> {
        let entry = DhtEntry::new(key, value, now_ms(), ttl.as_millis() as u64);
        if !self.with_state(|s| s.replace(entry.clone())) {
            warn!(%key, "local dht store is full; record only replicated");
        }

        let frame = Frame::new(FrameKind::DhtStore, &StoreBody { entry })?;
        let replicas = self
            .closest_neighbors(&key)
            .into_iter()
            .filter(|peer| self.overlay.send(peer, frame.clone()))
            .count();
        trace!(%key, replicas, "dht put");
        Ok(replicas + 1)
    }

    async fn get(&self, key: DhtKey) -> Result<Option<DhtValue>> {
        let now = now_ms();
        if let Some(entry) = self.with_state(|s| s.get(&key, now).cloned()) {
            return Ok(Some(entry.value));
        }

        let request = Frame::new(FrameKind::DhtFind, &FindBody { key })?;
        let queries = self.closest_neighbors(&key).into_iter().map(|peer| {
            let request = request.clone();
            async move {
                self.overlay
                    .request(&peer, request, Some(self.query_timeout))
                    .await
            }
        });

        let newest = join_all(queries)
            .await
            .into_iter()
            .filter_map(|reply| match reply {
                Ok(frame) => frame.decode::<FoundBody>().ok().and_then(|b| b.entry),
                Err(e) => {
                    trace!("dht find failed: {}", e);
                    None
                }
            })
            .filter(|e| e.key == key)
            .filter_map(|e| self.policy.admit(e, now))
            .max_by_key(|e| e.timestamp);

        Ok(newest.map(|entry| {
            let value = entry.value.clone();
            self.with_state(|s| s.put_entry(entry));
            value
        }))
    }

    async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let mut reached = 0;
        for seed in seeds {
            match self.overlay.connect(*seed).await {
                Ok(peer) => {
                    debug!(%seed, %peer, "joined through seed");
                    reached += 1;
                }
                Err(OverlayError::NotAdmitted(AdmitOutcome::RejectedDuplicatePeer)) => reached += 1,
                Err(e) => debug!(%seed, "seed unreachable: {}", e),
            }
        }
        if seeds.is_empty() && !self.overlay.registry().is_empty() {
            reached = 1;
        }
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{descriptor_key, PeerDescriptor};
    use soulmesh_identity::{Capability, HandshakeVerifier, PeerIdentity};
    use soulmesh_overlay::{FrameHandler, NeighborRegistry, SessionConfig};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    struct DhtHandler(Arc<OverlayRendezvous>);

    #[async_trait]
    impl FrameHandler for DhtHandler {
        async fn handle_frame(&self, _from: &str, frame: Frame) -> Option<Frame> {
            match frame.kind {
                FrameKind::DhtStore => {
                    self.0.handle_store(&frame);
                    None
                }
                FrameKind::DhtFind => self.0.handle_find(&frame),
                _ => None,
            }
        }
    }

    fn node() -> (Arc<Overlay>, Arc<OverlayRendezvous>) {
        let overlay = Overlay::new(
            Arc::new(PeerIdentity::generate()),
            Arc::new(NeighborRegistry::default()),
            HandshakeVerifier::default(),
            SessionConfig::default(),
        );
        let dht = Arc::new(OverlayRendezvous::new(overlay.clone(), 3, Duration::from_secs(2)));
        overlay.set_handler(Arc::new(DhtHandler(dht.clone())));
        (overlay, dht)
    }

    /// A signed descriptor for a fresh identity and the key it belongs under.
    fn record() -> (String, DhtKey, DhtValue) {
        let identity = PeerIdentity::generate();
        let descriptor =
            PeerDescriptor::signed(&identity, vec!["127.0.0.1:7000".into()], vec![Capability::Mesh], now_ms()).unwrap();
        let peer_id = identity.peer_id().to_string();
        (peer_id.clone(), descriptor_key(&peer_id), descriptor.to_bytes().unwrap().into())
    }

    fn store(entry: DhtEntry) -> Frame {
        Frame::new(FrameKind::DhtStore, &StoreBody { entry }).unwrap()
    }

    #[tokio::test]
    async fn put_replicates_and_get_queries_neighbors() {
        let cancel = CancellationToken::new();
        let (a_overlay, a_dht) = node();
        let (b_overlay, b_dht) = node();
        let (_c_overlay, c_dht) = node();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_addr = listener.local_addr().unwrap();
        tokio::spawn(b_overlay.clone().listen(listener, cancel.clone()));

        assert_eq!(a_dht.bootstrap(&[b_addr]).await.unwrap(), 1);
        let a_id = a_overlay.local_peer_id().to_string();
        for _ in 0..200 {
            if b_overlay.registry().contains(&a_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (_, key, value) = record();
        let replicas = a_dht.put(key, value.clone(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(replicas, 2);

        for _ in 0..200 {
            if b_dht.local_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b_dht.local_len(), 1);

        // Isolated node sees nothing.
        assert!(c_dht.get(key).await.unwrap().is_none());

        // A record only B holds is fetched over the wire.
        let (_, only_b, remote) = record();
        b_dht.with_state(|s| s.put_entry(DhtEntry::new(only_b, remote.clone(), now_ms(), 60_000)));
        assert_eq!(a_dht.get(only_b).await.unwrap(), Some(remote));

        // Answers that fail validation are not believed or cached.
        let (_, junk_key, _) = record();
        b_dht.with_state(|s| s.put_entry(DhtEntry::new(junk_key, "junk".into(), now_ms(), 60_000)));
        assert!(a_dht.get(junk_key).await.unwrap().is_none());
        assert_eq!(a_dht.local_len(), 2);
        cancel.cancel();
    }

    #[test]
    fn expired_store_is_ignored() {
        let (_overlay, dht) = node();
        let (_, key, value) = record();
        assert!(!dht.handle_store(&store(DhtEntry::new(key, value, 0, 1))));
        assert_eq!(dht.local_len(), 0);
    }

    #[tokio::test]
    async fn future_dated_junk_cannot_shadow_a_descriptor() {
        let (_overlay, dht) = node();
        let (_, key, real) = record();
        let far_future = now_ms() + 1_000_000_000;
        assert!(!dht.handle_store(&store(DhtEntry::new(key, "junk".into(), far_future, 60_000))));

        dht.put(key, real.clone(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(dht.get(key).await.unwrap(), Some(real));
    }

    #[tokio::test]
    async fn own_write_beats_a_replicated_copy() {
        let (_overlay, dht) = node();
        let (_, key, replicated) = record();
        // Within the allowed skew, so admitted.
        assert!(dht.handle_store(&store(DhtEntry::new(key, replicated, now_ms() + 10_000, 60_000))));

        let (_, _, mine) = record();
        dht.put(key, mine.clone(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(dht.get(key).await.unwrap(), Some(mine));
    }

    #[test]
    fn remote_records_are_checked_before_storing() {
        let (_overlay, dht) = node();
        let now = now_ms();

        // Valid descriptor under someone else's key.
        let (_, _, value) = record();
        let (_, other_key, _) = record();
        assert!(!dht.handle_store(&store(DhtEntry::new(other_key, value, now, 60_000))));

        // Valid descriptor, too far ahead.
        let (_, key, value) = record();
        assert!(!dht.handle_store(&store(DhtEntry::new(key, value.clone(), now + 60_000, 60_000))));

        // Accepted, with its lifetime cut to the policy maximum.
        assert!(dht.handle_store(&store(DhtEntry::new(key, value, now, u64::MAX))));
        let stored = dht.with_state(|s| s.get(&key, now).cloned()).unwrap();
        assert_eq!(stored.expires_at, now + 60 * 60 * 1000);
        assert_eq!(dht.local_len(), 1);
    }

    #[test]
    fn generic_policy_still_bounds_time() {
        let policy = RecordPolicy::default().with_descriptors_only(false).with_max_ttl(Duration::from_secs(10));
        let key = crate::hash_key(b"anything");

        let admitted = policy.admit(DhtEntry::new(key, "v".into(), 1_000, 60_000), 2_000).unwrap();
        assert_eq!(admitted.expires_at, 11_000);
        assert!(policy.admit(DhtEntry::new(key, "v".into(), 1_000, 60_000), 11_000).is_none());
        assert!(policy.admit(DhtEntry::new(key, "v".into(), 40_000, 60_000), 2_000).is_none());
    }
}
