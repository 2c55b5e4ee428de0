//! Persistence seam for metrics and bans.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::metrics::PeerPerformanceMetrics;

/// Durable storage keyed by peer id.
pub trait MetricsStore: Send + Sync {
    fn load_metrics(&self) -> Result<Vec<PeerPerformanceMetrics>>;

    fn save_metrics(&self, metrics: &PeerPerformanceMetrics) -> Result<()>;

    fn load_bans(&self) -> Result<Vec<(String, String)>>;

    fn save_ban(&self, peer_id: &str, reason: &str) -> Result<()>;

    fn remove_ban(&self, peer_id: &str) -> Result<()>;
}

/// Volatile store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryMetricsStore {
    metrics: Mutex<HashMap<String, PeerPerformanceMetrics>>,
    bans: Mutex<HashMap<String, String>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsStore for MemoryMetricsStore {
    fn load_metrics(&self) -> Result<Vec<PeerPerformanceMetrics>> {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        Ok(metrics.values().cloned().collect())
    }

    fn save_metrics(&self, m: &PeerPerformanceMetrics) -> Result<()> {
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        metrics.insert(m.peer_id.clone(), m.clone());
        Ok(())
    }

    fn load_bans(&self) -> Result<Vec<(String, String)>> {
        let bans = self.bans.lock().unwrap_or_else(|p| p.into_inner());
        Ok(bans.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn save_ban(&self, peer_id: &str, reason: &str) -> Result<()> {
        let mut bans = self.bans.lock().unwrap_or_else(|p| p.into_inner());
        bans.insert(peer_id.to_string(), reason.to_string());
        Ok(())
    }

    fn remove_ban(&self, peer_id: &str) -> Result<()> {
        let mut bans = self.bans.lock().unwrap_or_else(|p| p.into_inner());
        bans.remove(peer_id);
        Ok(())
    }
}
