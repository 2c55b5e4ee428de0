//! Rescue policy: when to stop waiting on a slow source.

use std::time::Duration;

/// Snapshot of one source during a swarm transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProgress {
    pub source: String,
    /// Age of the chunk request currently outstanding, if any.
    pub in_flight_for: Option<Duration>,
    /// Time since the source was handed its first chunk.
    pub active_for: Duration,
    pub bytes_received: u64,
    /// Queued plus in-flight chunks.
    pub chunks_remaining: usize,
}

impl SourceProgress {
    pub fn throughput(&self) -> f64 {
        let secs = self.active_for.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / secs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RescueDecision {
    Keep,
    /// Stop using the source, spread its remaining chunks, and bring in
    /// up to `extra_sources` standby sources.
    Rescue { reason: String, extra_sources: usize },
}

pub trait RescuePolicy: Send + Sync {
    fn evaluate(&self, progress: &SourceProgress) -> RescueDecision;
}

/// Rescue on a stalled request or sustained low throughput.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputRescue {
    pub min_bytes_per_sec: f64,
    /// A single outstanding request older than this is a stall.
    pub stall_after: Duration,
    /// Throughput is not judged before this much activity.
    pub grace: Duration,
    pub extra_sources: usize,
}

impl Default for ThroughputRescue {
    fn default() -> Self {
        Self {
            min_bytes_per_sec: 16.0 * 1024.0,
            stall_after: Duration::from_secs(10),
            grace: Duration::from_secs(15),
            extra_sources: 2,
        }
    }
}

impl ThroughputRescue {
    pub fn with_min_bytes_per_sec(mut self, rate: f64) -> Self {
        self.min_bytes_per_sec = rate;
        self
    }

    pub fn with_stall_after(mut self, d: Duration) -> Self {
        self.stall_after = d;
        self
    }

    pub fn with_grace(mut self, d: Duration) -> Self {
        self.grace = d;
        self
    }

    pub fn with_extra_sources(mut self, n: usize) -> Self {
        self.extra_sources = n;
        self
    }
}

impl RescuePolicy for ThroughputRescue {
    fn evaluate(&self, progress: &SourceProgress) -> RescueDecision {
        if progress.chunks_remaining == 0 {
            return RescueDecision::Keep;
        }
        if let Some(age) = progress.in_flight_for {
            if age >= self.stall_after {
                return RescueDecision::Rescue {
                    reason: format!("request outstanding for {:.1}s", age.as_secs_f64()),
                    extra_sources: self.extra_sources,
                };
            }
        }
        if progress.active_for >= self.grace && progress.throughput() < self.min_bytes_per_sec {
            return RescueDecision::Rescue {
                reason: format!(
                    "throughput {:.0} B/s below {:.0} B/s",
                    progress.throughput(),
                    self.min_bytes_per_sec
                ),
                extra_sources: self.extra_sources,
            };
        }
        RescueDecision::Keep
    }
}
