//! Peer ranking score.
//!
//! ```text
//! rank = w_rep * reputation + w_perf * performance(throughput, rtt) + w_avail * availability(recency)
//! ```
//!
//! Every sub-score is in [0, 1]. A peer without history scores
//! [`NEUTRAL_SCORE`] on each, so new peers are not starved.

use serde::{Deserialize, Serialize};

use crate::metrics::{PeerPerformanceMetrics, NEUTRAL_SCORE};

/// Throughput that scores 0.5 (1 MiB/s).
pub const REFERENCE_THROUGHPUT: f64 = 1024.0 * 1024.0;

/// Round trip that scores 0.5.
pub const REFERENCE_RTT_MS: f64 = 100.0;

/// Age at which availability halves.
pub const AVAILABILITY_HALF_LIFE_MS: f64 = 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    pub reputation: f64,
    pub performance: f64,
    pub availability: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            reputation: 0.5,
            performance: 0.3,
            availability: 0.2,
        }
    }
}

impl RankingWeights {
    pub fn with_reputation(mut self, w: f64) -> Self {
        self.reputation = w;
        self
    }

    pub fn with_performance(mut self, w: f64) -> Self {
        self.performance = w;
        self
    }

    pub fn with_availability(mut self, w: f64) -> Self {
        self.availability = w;
        self
    }

    fn total(&self) -> f64 {
        self.reputation + self.performance + self.availability
    }
}

/// Throughput and RTT folded into [0, 1].
pub fn performance_score(metrics: &PeerPerformanceMetrics) -> f64 {
    if !metrics.has_history() {
        return NEUTRAL_SCORE;
    }
    let throughput = metrics.throughput_avg_bytes_per_sec.max(0.0);
    let throughput_score = throughput / (throughput + REFERENCE_THROUGHPUT);
    let rtt_score = if metrics.rtt_avg_ms > 0.0 {
        REFERENCE_RTT_MS / (REFERENCE_RTT_MS + metrics.rtt_avg_ms)
    } else {
        NEUTRAL_SCORE
    };
    0.5 * throughput_score + 0.5 * rtt_score
}

/// Recency of the last interaction, halving every hour.
pub fn availability_score(metrics: &PeerPerformanceMetrics, now_ms: u64) -> f64 {
    if !metrics.has_history() {
        return NEUTRAL_SCORE;
    }
    let age = now_ms.saturating_sub(metrics.last_updated_ms) as f64;
    0.5f64.powf(age / AVAILABILITY_HALF_LIFE_MS)
}

/// Weighted ranking score; `None` (unknown peer) is neutral.
pub fn ranking_score(
    metrics: Option<&PeerPerformanceMetrics>,
    weights: &RankingWeights,
    now_ms: u64,
) -> f64 {
    let Some(m) = metrics else {
        return NEUTRAL_SCORE;
    };
    let total = weights.total();
    if total <= 0.0 {
        return NEUTRAL_SCORE;
    }
    let raw = weights.reputation * m.reputation_score
        + weights.performance * performance_score(m)
        + weights.availability * availability_score(m, now_ms);
    (raw / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkOutcome;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn unknown_peer_is_neutral() {
        assert_eq!(ranking_score(None, &RankingWeights::default(), 0), NEUTRAL_SCORE);
        let fresh = PeerPerformanceMetrics::new("p", 0);
        assert!((ranking_score(Some(&fresh), &RankingWeights::default(), 0) - NEUTRAL_SCORE).abs() < 1e-9);
    }

    #[test]
    fn fast_reliable_peer_outranks_flaky() {
        let weights = RankingWeights::default();
        let mut fast = PeerPerformanceMetrics::new("fast", 0);
        let mut flaky = PeerPerformanceMetrics::new("flaky", 0);
        for _ in 0..10 {
            fast.record(ChunkOutcome::Completed, 20.0, 4 << 20, Duration::from_secs(1), 0.2, 1000);
            flaky.record(ChunkOutcome::Failed, 400.0, 0, Duration::ZERO, 0.2, 1000);
        }
        assert!(ranking_score(Some(&fast), &weights, 1000) > ranking_score(Some(&flaky), &weights, 1000));
    }

    #[test]
    fn availability_halves_per_hour() {
        let mut m = PeerPerformanceMetrics::new("p", 0);
        m.record(ChunkOutcome::Completed, 10.0, 10, Duration::from_secs(1), 0.2, 0);
        assert!((availability_score(&m, 0) - 1.0).abs() < 1e-9);
        let hour = AVAILABILITY_HALF_LIFE_MS as u64;
        assert!((availability_score(&m, hour) - 0.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn score_stays_in_unit_range(
            outcomes in proptest::collection::vec(0u8..4, 0..50),
            rtt in 0.0f64..10_000.0,
            bytes in 0u64..100_000_000,
            age in 0u64..1_000_000_000,
        ) {
            let mut m = PeerPerformanceMetrics::new("p", 0);
            for o in outcomes {
                let outcome = match o {
                    0 => ChunkOutcome::Completed,
                    1 => ChunkOutcome::Failed,
                    2 => ChunkOutcome::TimedOut,
                    _ => ChunkOutcome::Corrupted,
                };
                m.record(outcome, rtt, bytes, Duration::from_millis(250), 0.2, 0);
            }
            let score = ranking_score(Some(&m), &RankingWeights::default(), age);
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
