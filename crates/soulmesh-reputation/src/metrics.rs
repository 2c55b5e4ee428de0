//! Rolling per-peer performance statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Score given to peers with no history.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Result of one chunk transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkOutcome {
    Completed,
    Failed,
    TimedOut,
    /// Data arrived but failed its integrity check.
    Corrupted,
}

impl ChunkOutcome {
    /// Reputation sample contributed by this outcome.
    pub fn sample(&self) -> f64 {
        match self {
            ChunkOutcome::Completed => 1.0,
            ChunkOutcome::TimedOut => 0.3,
            ChunkOutcome::Failed => 0.2,
            ChunkOutcome::Corrupted => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPerformanceMetrics {
    pub peer_id: String,
    /// 0..=1
    pub reputation_score: f64,
    pub rtt_avg_ms: f64,
    pub throughput_avg_bytes_per_sec: f64,
    pub chunks_completed: u64,
    pub chunks_failed: u64,
    pub chunks_timed_out: u64,
    pub chunks_corrupted: u64,
    /// Unix milliseconds.
    pub last_updated_ms: u64,
}

impl PeerPerformanceMetrics {
    pub fn new(peer_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            peer_id: peer_id.into(),
            reputation_score: NEUTRAL_SCORE,
            rtt_avg_ms: 0.0,
            throughput_avg_bytes_per_sec: 0.0,
            chunks_completed: 0,
            chunks_failed: 0,
            chunks_timed_out: 0,
            chunks_corrupted: 0,
            last_updated_ms: now_ms,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.chunks_completed + self.chunks_failed + self.chunks_timed_out + self.chunks_corrupted
    }

    pub fn has_history(&self) -> bool {
        self.total_chunks() > 0
    }

    pub fn success_rate(&self) -> f64 {
        match self.total_chunks() {
            0 => NEUTRAL_SCORE,
            total => self.chunks_completed as f64 / total as f64,
        }
    }

    /// Fold one attempt into the counters and moving averages.
    ///
    /// `alpha` is the EMA weight of the new sample. The first RTT and
    /// throughput samples seed their averages directly.
    pub fn record(
        &mut self,
        outcome: ChunkOutcome,
        rtt_ms: f64,
        bytes: u64,
        elapsed: Duration,
        alpha: f64,
        now_ms: u64,
    ) {
        let alpha = alpha.clamp(0.0, 1.0);
        let first_rtt = self.total_chunks() == 0;
        let first_throughput = self.chunks_completed == 0;

        match outcome {
            ChunkOutcome::Completed => self.chunks_completed += 1,
            ChunkOutcome::Failed => self.chunks_failed += 1,
            ChunkOutcome::TimedOut => self.chunks_timed_out += 1,
            ChunkOutcome::Corrupted => self.chunks_corrupted += 1,
        }

        self.reputation_score =
            (self.reputation_score * (1.0 - alpha) + outcome.sample() * alpha).clamp(0.0, 1.0);

        if rtt_ms.is_finite() && rtt_ms > 0.0 {
            self.rtt_avg_ms = if first_rtt {
                rtt_ms
            } else {
                self.rtt_avg_ms * (1.0 - alpha) + rtt_ms * alpha
            };
        }

        let secs = elapsed.as_secs_f64();
        if outcome == ChunkOutcome::Completed && bytes > 0 && secs > 0.0 {
            let sample = bytes as f64 / secs;
            self.throughput_avg_bytes_per_sec = if first_throughput {
                sample
            } else {
                self.throughput_avg_bytes_per_sec * (1.0 - alpha) + sample * alpha
            };
        }

        self.last_updated_ms = self.last_updated_ms.max(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_neutral() {
        let m = PeerPerformanceMetrics::new("p", 0);
        assert_eq!(m.reputation_score, NEUTRAL_SCORE);
        assert!(!m.has_history());
        assert_eq!(m.success_rate(), NEUTRAL_SCORE);
    }

    #[test]
    fn outcomes_order_reputation() {
        let mut good = PeerPerformanceMetrics::new("good", 0);
        let mut slow = PeerPerformanceMetrics::new("slow", 0);
        let mut bad = PeerPerformanceMetrics::new("bad", 0);
        for _ in 0..5 {
            good.record(ChunkOutcome::Completed, 20.0, 1000, Duration::from_millis(10), 0.2, 1);
            slow.record(ChunkOutcome::TimedOut, 0.0, 0, Duration::ZERO, 0.2, 1);
            bad.record(ChunkOutcome::Corrupted, 20.0, 1000, Duration::from_millis(10), 0.2, 1);
        }
        assert!(good.reputation_score > NEUTRAL_SCORE);
        assert!(slow.reputation_score < NEUTRAL_SCORE);
        assert!(bad.reputation_score < slow.reputation_score);
        assert_eq!(bad.chunks_corrupted, 5);
        assert_eq!(bad.throughput_avg_bytes_per_sec, 0.0);
    }

    #[test]
    fn first_samples_seed_averages() {
        let mut m = PeerPerformanceMetrics::new("p", 0);
        m.record(ChunkOutcome::Completed, 40.0, 2000, Duration::from_secs(1), 0.2, 5);
        assert_eq!(m.rtt_avg_ms, 40.0);
        assert_eq!(m.throughput_avg_bytes_per_sec, 2000.0);
        m.record(ChunkOutcome::Completed, 80.0, 4000, Duration::from_secs(1), 0.5, 6);
        assert_eq!(m.rtt_avg_ms, 60.0);
        assert_eq!(m.throughput_avg_bytes_per_sec, 3000.0);
        assert_eq!(m.last_updated_ms, 6);
    }
}
