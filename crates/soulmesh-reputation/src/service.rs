//! Concurrent per-peer metrics service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decay::DecayConfig;
use crate::error::Result;
use crate::metrics::{ChunkOutcome, PeerPerformanceMetrics};
use crate::ranking::{ranking_score, RankingWeights};
use crate::store::MetricsStore;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    /// EMA weight of each new sample.
    pub alpha: f64,
    pub weights: RankingWeights,
    pub decay: DecayConfig,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            weights: RankingWeights::default(),
            decay: DecayConfig::default(),
        }
    }
}

impl ReputationConfig {
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_weights(mut self, weights: RankingWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_decay(mut self, decay: DecayConfig) -> Self {
        self.decay = decay;
        self
    }
}

/// Per-peer metrics plus an explicit ban list.
///
/// Updates go through the map's entry lock, so each peer's record is
/// mutated atomically. Nothing spans peers.
pub struct PeerMetricsService {
    config: ReputationConfig,
    metrics: DashMap<String, PeerPerformanceMetrics>,
    banned: DashMap<String, String>,
    last_decay_ms: AtomicU64,
    store: Option<Arc<dyn MetricsStore>>,
}

impl PeerMetricsService {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            metrics: DashMap::new(),
            banned: DashMap::new(),
            last_decay_ms: AtomicU64::new(now_ms()),
            store: None,
        }
    }

    /// Attach a store and load whatever it already holds.
    pub fn with_store(config: ReputationConfig, store: Arc<dyn MetricsStore>) -> Result<Self> {
        let mut service = Self::new(config);
        service.store = Some(store);
        service.load_from_store()?;
        Ok(service)
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    pub fn record_chunk_result(
        &self,
        peer_id: &str,
        outcome: ChunkOutcome,
        rtt_ms: f64,
        bytes_transferred: u64,
        elapsed: Duration,
    ) {
        self.record_chunk_result_at(peer_id, outcome, rtt_ms, bytes_transferred, elapsed, now_ms());
    }

    pub fn record_chunk_result_at(
        &self,
        peer_id: &str,
        outcome: ChunkOutcome,
        rtt_ms: f64,
        bytes_transferred: u64,
        elapsed: Duration,
        now_ms: u64,
    ) {
        let mut entry = self
            .metrics
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerPerformanceMetrics::new(peer_id, now_ms));
        entry.record(outcome, rtt_ms, bytes_transferred, elapsed, self.config.alpha, now_ms);
        if outcome != ChunkOutcome::Completed {
            debug!(
                peer = %peer_id,
                ?outcome,
                score = entry.reputation_score,
                "Chunk attempt penalized"
            );
        }
    }

    /// `None` for peers never seen; callers treat that as neutral.
    pub fn get_metrics(&self, peer_id: &str) -> Option<PeerPerformanceMetrics> {
        self.metrics.get(peer_id).map(|m| m.clone())
    }

    pub fn ranking_score(&self, peer_id: &str) -> f64 {
        self.ranking_score_at(peer_id, now_ms())
    }

    pub fn ranking_score_at(&self, peer_id: &str, now_ms: u64) -> f64 {
        let metrics = self.metrics.get(peer_id);
        ranking_score(metrics.as_deref(), &self.config.weights, now_ms)
    }

    /// Known, unbanned peers ordered by reputation, best first.
    pub fn get_ranked_peers(&self, limit: usize) -> Vec<PeerPerformanceMetrics> {
        let mut peers: Vec<PeerPerformanceMetrics> = self
            .metrics
            .iter()
            .filter(|m| !self.banned.contains_key(m.key()))
            .map(|m| m.value().clone())
            .collect();
        peers.sort_by(|a, b| {
            b.reputation_score
                .total_cmp(&a.reputation_score)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        peers.truncate(limit);
        peers
    }

    pub fn ban_peer(&self, peer_id: &str, reason: &str) {
        info!(peer = %peer_id, %reason, "Peer banned");
        self.banned.insert(peer_id.to_string(), reason.to_string());
        if let Some(store) = &self.store {
            if let Err(e) = store.save_ban(peer_id, reason) {
                warn!(peer = %peer_id, error = %e, "Failed to persist ban");
            }
        }
    }

    pub fn unban_peer(&self, peer_id: &str) -> bool {
        let removed = self.banned.remove(peer_id).is_some();
        if removed {
            info!(peer = %peer_id, "Peer unbanned");
            if let Some(store) = &self.store {
                if let Err(e) = store.remove_ban(peer_id) {
                    warn!(peer = %peer_id, error = %e, "Failed to persist unban");
                }
            }
        }
        removed
    }

    pub fn is_peer_banned(&self, peer_id: &str) -> bool {
        self.banned.contains_key(peer_id)
    }

    pub fn banned_peers(&self) -> Vec<(String, String)> {
        let mut bans: Vec<_> = self
            .banned
            .iter()
            .map(|b| (b.key().clone(), b.value().clone()))
            .collect();
        bans.sort();
        bans
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Apply every whole decay interval elapsed since the last call.
    /// Returns the number of intervals applied.
    pub fn apply_decay(&self, now_ms: u64) -> u32 {
        let interval = self.config.decay.interval.as_millis().max(1) as u64;
        let last = self.last_decay_ms.load(Ordering::Acquire);
        let periods = self.config.decay.periods_between(last, now_ms);
        if periods == 0 {
            return 0;
        }
        let advanced = last.saturating_add(periods as u64 * interval);
        if self
            .last_decay_ms
            .compare_exchange(last, advanced, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller already applied these intervals.
            return 0;
        }
        for mut entry in self.metrics.iter_mut() {
            self.config.decay.apply(entry.value_mut(), periods);
        }
        debug!(periods, peers = self.metrics.len(), "Reputation decayed");
        periods
    }

    pub fn load_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let metrics = store.load_metrics()?;
        let count = metrics.len();
        for m in metrics {
            self.metrics.insert(m.peer_id.clone(), m);
        }
        for (peer, reason) in store.load_bans()? {
            self.banned.insert(peer, reason);
        }
        info!(peers = count, bans = self.banned.len(), "Loaded peer metrics");
        Ok(count)
    }

    /// Write every record to the store.
    pub fn flush(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let snapshot: Vec<PeerPerformanceMetrics> =
            self.metrics.iter().map(|m| m.value().clone()).collect();
        for m in &snapshot {
            store.save_metrics(m)?;
        }
        Ok(snapshot.len())
    }

    /// Periodic decay and flush until `cancel` fires, then a final flush.
    pub async fn run_maintenance(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.apply_decay(now_ms());
                    if let Err(e) = self.flush() {
                        warn!(error = %e, "Metrics flush failed");
                    }
                }
            }
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "Final metrics flush failed");
        }
    }
}

impl Default for PeerMetricsService {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}
