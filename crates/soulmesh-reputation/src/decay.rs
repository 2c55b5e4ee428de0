//! Reputation decay toward the neutral baseline.

use std::time::Duration;

use crate::metrics::{PeerPerformanceMetrics, NEUTRAL_SCORE};

/// Default per-interval decay rate (5%).
pub const DEFAULT_DECAY_RATE: f64 = 0.05;

/// Default decay interval (1 hour).
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayConfig {
    /// Fraction of the distance to `target` closed per interval.
    pub rate: f64,
    pub interval: Duration,
    pub target: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_DECAY_RATE,
            interval: DEFAULT_DECAY_INTERVAL,
            target: NEUTRAL_SCORE,
        }
    }
}

impl DecayConfig {
    pub fn new(rate: f64, interval: Duration) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            interval: interval.max(Duration::from_millis(1)),
            target: NEUTRAL_SCORE,
        }
    }

    /// Number of whole intervals between `since_ms` and `now_ms`.
    pub fn periods_between(&self, since_ms: u64, now_ms: u64) -> u32 {
        let interval = self.interval.as_millis().max(1) as u64;
        (now_ms.saturating_sub(since_ms) / interval).min(u32::MAX as u64) as u32
    }

    /// Move `metrics.reputation_score` toward the target for `periods` intervals.
    pub fn apply(&self, metrics: &mut PeerPerformanceMetrics, periods: u32) {
        if periods == 0 {
            return;
        }
        let remaining = (1.0 - self.rate).powi(periods.min(i32::MAX as u32) as i32);
        let score = metrics.reputation_score;
        metrics.reputation_score = self.target + (score - self.target) * remaining;
    }
}
