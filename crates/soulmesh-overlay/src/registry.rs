//! Bounded neighbor registry.
//!
//! The registry is the only owner of live neighbor connections. Other
//! components look neighbors up by peer id and get plain [`NeighborInfo`]
//! snapshots back; they never hold the connection itself.
//!
//! # Invariants
//!
//! - `len() <= max_neighbors`
//! - connections per remote IP `<= max_per_address`
//! - `needs_more_neighbors()` iff `len() < min_neighbors`
//! - admission and the per-address counters change under the same lock
//!
//! Eviction only happens as part of admitting a strictly better candidate,
//! so the count never drops because of eviction.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::Frame;

/// Neighbor count limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub min_neighbors: usize,
    pub max_neighbors: usize,
    pub max_per_address: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            min_neighbors: 3,
            max_neighbors: 10,
            max_per_address: 3,
        }
    }
}

impl RegistryLimits {
    pub fn with_min_neighbors(mut self, n: usize) -> Self {
        self.min_neighbors = n;
        self
    }

    pub fn with_max_neighbors(mut self, n: usize) -> Self {
        self.max_neighbors = n;
        self
    }

    pub fn with_max_per_address(mut self, n: usize) -> Self {
        self.max_per_address = n;
        self
    }

    /// Clamp into a consistent shape (`1 <= max`, `min <= max`, `1 <= per_address`).
    pub fn normalized(self) -> Self {
        let max_neighbors = self.max_neighbors.max(1);
        Self {
            min_neighbors: self.min_neighbors.min(max_neighbors),
            max_neighbors,
            max_per_address: self.max_per_address.max(1),
        }
    }
}

/// A connection that finished its handshake and asks to be admitted.
#[derive(Debug)]
pub struct CandidateConnection {
    pub peer_id: String,
    pub remote_addr: SocketAddr,
    /// Measured round trip, if known. Unknown latency ranks worst.
    pub latency: Option<Duration>,
    pub outbox: Option<mpsc::Sender<Frame>>,
}

impl CandidateConnection {
    pub fn new(peer_id: impl Into<String>, remote_addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            remote_addr,
            latency: None,
            outbox: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_outbox(mut self, outbox: mpsc::Sender<Frame>) -> Self {
        self.outbox = Some(outbox);
        self
    }
}

/// Snapshot of an admitted neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborInfo {
    pub peer_id: String,
    pub remote_addr: SocketAddr,
    pub connection_id: u64,
    pub established_at: Instant,
    pub latency: Option<Duration>,
    /// 0-based slot among connections from the same IP at admission time.
    pub per_address_slot: usize,
}

/// Handle a session keeps for its own connection.
#[derive(Debug, Clone)]
pub struct NeighborLease {
    pub connection_id: u64,
    pub cancel: CancellationToken,
}

/// Result of [`NeighborRegistry::try_admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    /// Admitted after evicting a weaker neighbor.
    Replaced { evicted: String },
    RejectedAddressLimit,
    RejectedFull,
    RejectedDuplicatePeer,
    RejectedShutdown,
}

impl AdmitOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmitOutcome::Admitted | AdmitOutcome::Replaced { .. })
    }
}

struct NeighborEntry {
    info: NeighborInfo,
    outbox: Option<mpsc::Sender<Frame>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    neighbors: HashMap<String, NeighborEntry>,
    per_address: HashMap<IpAddr, usize>,
}

impl RegistryState {
    fn address_count(&self, ip: &IpAddr) -> usize {
        self.per_address.get(ip).copied().unwrap_or(0)
    }

    fn detach(&mut self, peer_id: &str) -> Option<NeighborEntry> {
        let entry = self.neighbors.remove(peer_id)?;
        let ip = entry.info.remote_addr.ip();
        if let Some(count) = self.per_address.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_address.remove(&ip);
            }
        }
        Some(entry)
    }

    /// Ranking key, lower is better: (address crowding, latency).
    fn quality(&self, info: &NeighborInfo) -> (usize, Duration) {
        (
            self.address_count(&info.remote_addr.ip()),
            info.latency.unwrap_or(Duration::MAX),
        )
    }

    /// The weakest neighbor; ties go to the oldest connection.
    fn weakest(&self) -> Option<(&str, (usize, Duration))> {
        self.neighbors
            .values()
            .map(|e| (e.info.peer_id.as_str(), self.quality(&e.info), e.info.established_at))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
            .map(|(id, q, _)| (id, q))
    }
}

/// Bounded set of live overlay connections.
pub struct NeighborRegistry {
    limits: RegistryLimits,
    state: Mutex<RegistryState>,
    next_connection_id: AtomicU64,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl NeighborRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits: limits.normalized(),
            state: Mutex::new(RegistryState::default()),
            next_connection_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        // A panic while holding the lock leaves the maps consistent: every
        // mutation below completes before any call that could unwind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate-then-admit. Never performs I/O.
    pub fn try_admit(&self, candidate: CandidateConnection) -> AdmitOutcome {
        if self.disposed.load(Ordering::Acquire) {
            return AdmitOutcome::RejectedShutdown;
        }

        let ip = candidate.remote_addr.ip();
        let mut evicted_entry = None;
        let outcome = {
            let mut state = self.lock();

            if state.neighbors.contains_key(&candidate.peer_id) {
                return AdmitOutcome::RejectedDuplicatePeer;
            }

            let same_address = state.address_count(&ip);
            if same_address >= self.limits.max_per_address {
                debug!(peer = %candidate.peer_id, %ip, "address connection limit reached");
                return AdmitOutcome::RejectedAddressLimit;
            }

            let mut outcome = AdmitOutcome::Admitted;
            if state.neighbors.len() >= self.limits.max_neighbors {
                let candidate_quality = (
                    same_address + 1,
                    candidate.latency.unwrap_or(Duration::MAX),
                );
                let victim = match state.weakest() {
                    Some((id, worst)) if candidate_quality < worst => id.to_string(),
                    _ => return AdmitOutcome::RejectedFull,
                };
                evicted_entry = state.detach(&victim);
                outcome = AdmitOutcome::Replaced { evicted: victim };
            }

            let info = NeighborInfo {
                peer_id: candidate.peer_id.clone(),
                remote_addr: candidate.remote_addr,
                connection_id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
                established_at: Instant::now(),
                latency: candidate.latency,
                per_address_slot: state.address_count(&ip),
            };
            *state.per_address.entry(ip).or_insert(0) += 1;
            state.neighbors.insert(
                candidate.peer_id,
                NeighborEntry {
                    info,
                    outbox: candidate.outbox,
                    cancel: self.shutdown.child_token(),
                },
            );
            outcome
        };

        if let Some(entry) = evicted_entry {
            info!(peer = %entry.info.peer_id, "evicting neighbor for a better candidate");
            entry.cancel.cancel();
        }
        outcome
    }

    /// True while fewer than `min_neighbors` are connected.
    pub fn needs_more_neighbors(&self) -> bool {
        self.len() < self.limits.min_neighbors
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.limits.max_neighbors
    }

    pub fn len(&self) -> usize {
        self.lock().neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.lock().neighbors.contains_key(peer_id)
    }

    /// Live connections from one IP.
    pub fn connections_from(&self, ip: &IpAddr) -> usize {
        self.lock().address_count(ip)
    }

    pub fn get(&self, peer_id: &str) -> Option<NeighborInfo> {
        self.lock().neighbors.get(peer_id).map(|e| e.info.clone())
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        let mut list: Vec<_> = self.lock().neighbors.values().map(|e| e.info.clone()).collect();
        list.sort_by_key(|n| n.established_at);
        list
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.neighbors().into_iter().map(|n| n.peer_id).collect()
    }

    /// Cancellation handle and connection id for an admitted neighbor.
    pub fn lease(&self, peer_id: &str) -> Option<NeighborLease> {
        self.lock().neighbors.get(peer_id).map(|e| NeighborLease {
            connection_id: e.info.connection_id,
            cancel: e.cancel.clone(),
        })
    }

    /// Remove a neighbor and cancel its session.
    pub fn remove(&self, peer_id: &str) -> Option<NeighborInfo> {
        let entry = self.lock().detach(peer_id)?;
        entry.cancel.cancel();
        Some(entry.info)
    }

    /// Remove a neighbor only if it is still the given connection.
    ///
    /// Sessions call this on disconnect so that a stale session cannot
    /// remove a newer connection of the same peer.
    pub fn remove_connection(&self, peer_id: &str, connection_id: u64) -> bool {
        let entry = {
            let mut state = self.lock();
            match state.neighbors.get(peer_id) {
                Some(e) if e.info.connection_id == connection_id => state.detach(peer_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Queue a frame for one neighbor. Returns false if unknown or its queue is full.
    pub fn send(&self, peer_id: &str, frame: Frame) -> bool {
        let outbox = self.lock().neighbors.get(peer_id).and_then(|e| e.outbox.clone());
        match outbox {
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %peer_id, "outbound queue full, dropping frame");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Queue a frame for every neighbor except `exclude`. Returns how many accepted it.
    pub fn broadcast_except(&self, exclude: Option<&str>, frame: &Frame) -> usize {
        let targets: Vec<(String, mpsc::Sender<Frame>)> = self
            .lock()
            .neighbors
            .values()
            .filter(|e| Some(e.info.peer_id.as_str()) != exclude)
            .filter_map(|e| e.outbox.clone().map(|tx| (e.info.peer_id.clone(), tx)))
            .collect();

        let mut sent = 0;
        for (peer_id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer_id, "broadcast skipped: {}", e),
            }
        }
        sent
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Token cancelled when the registry is disposed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drop every neighbor and refuse further admissions. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<NeighborEntry> = {
            let mut state = self.lock();
            state.per_address.clear();
            state.neighbors.drain().map(|(_, e)| e).collect()
        };
        let count = entries.len();
        self.shutdown.cancel();
        drop(entries);
        // Let session tasks observe their cancelled tokens.
        tokio::task::yield_now().await;
        info!("neighbor registry disposed ({} connections closed)", count);
    }
}

impl Default for NeighborRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}
