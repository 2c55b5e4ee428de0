//! Peer performance metrics and reputation.
//!
//! Every chunk attempt against a peer feeds [`PeerMetricsService::record_chunk_result`].
//! The service keeps rolling RTT/throughput averages, outcome counters and a
//! reputation score in [0, 1] per peer, plus an explicit ban list that the
//! planner applies as a hard filter.
//!
//! # Design
//!
//! - Unknown peers are not an error: they rank at [`NEUTRAL_SCORE`].
//! - Reputation is an exponential moving average of per-outcome samples
//!   (completed 1.0, timed out 0.3, failed 0.2, corrupted 0.0).
//! - Scores decay back toward neutral so old behaviour stops dominating.
//! - Persistence is behind [`MetricsStore`]; the node supplies a sled store.

mod decay;
mod error;
mod metrics;
mod ranking;
mod service;
mod store;

pub use decay::{DecayConfig, DEFAULT_DECAY_INTERVAL, DEFAULT_DECAY_RATE};
pub use error::{Error, Result};
pub use metrics::{ChunkOutcome, PeerPerformanceMetrics, NEUTRAL_SCORE};
pub use ranking::{
    availability_score, performance_score, ranking_score, RankingWeights,
    AVAILABILITY_HALF_LIFE_MS, REFERENCE_RTT_MS, REFERENCE_THROUGHPUT,
};
pub use service::{now_ms, PeerMetricsService, ReputationConfig};
pub use store::{MemoryMetricsStore, MetricsStore};
