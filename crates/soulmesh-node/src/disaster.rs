//! Disaster mode: mesh-only operation while the legacy server is unreachable.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use soulmesh_discovery::SourceBackend;
use soulmesh_transfer::MultiSourcePlanner;
use tracing::{info, warn};

/// Backends that depend on the legacy server.
const LEGACY_BACKENDS: [SourceBackend; 1] = [SourceBackend::Soulseek];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisasterStatus {
    pub active: bool,
    pub legacy_reachable: bool,
    /// Operator decision; `None` follows reachability.
    pub operator_override: Option<bool>,
    pub active_since_ms: Option<u64>,
}

#[derive(Debug)]
struct State {
    legacy_reachable: bool,
    operator_override: Option<bool>,
    active_since_ms: Option<u64>,
}

impl State {
    fn is_active(&self) -> bool {
        self.operator_override.unwrap_or(!self.legacy_reachable)
    }
}

pub struct DisasterMode {
    planner: Arc<MultiSourcePlanner>,
    state: Mutex<State>,
}

impl DisasterMode {
    /// Starts inactive with the legacy server assumed reachable.
    pub fn new(planner: Arc<MultiSourcePlanner>) -> Self {
        Self {
            planner,
            state: Mutex::new(State {
                legacy_reachable: true,
                operator_override: None,
                active_since_ms: None,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    pub fn status(&self) -> DisasterStatus {
        let state = self.lock();
        DisasterStatus {
            active: state.is_active(),
            legacy_reachable: state.legacy_reachable,
            operator_override: state.operator_override,
            active_since_ms: state.active_since_ms,
        }
    }

    /// Reachability as reported by the legacy bridge.
    pub fn report_legacy_reachable(&self, reachable: bool, now_ms: u64) -> DisasterStatus {
        self.update(now_ms, |s| s.legacy_reachable = reachable)
    }

    /// Force disaster mode on or off, or hand control back with `None`.
    pub fn set_override(&self, forced: Option<bool>, now_ms: u64) -> DisasterStatus {
        self.update(now_ms, |s| s.operator_override = forced)
    }

    fn update(&self, now_ms: u64, change: impl FnOnce(&mut State)) -> DisasterStatus {
        let (was, now) = {
            let mut state = self.lock();
            let was = state.is_active();
            change(&mut state);
            let now = state.is_active();
            if was != now {
                state.active_since_ms = now.then_some(now_ms);
                for backend in LEGACY_BACKENDS {
                    self.planner.set_backend_enabled(backend, !now);
                }
            }
            (was, now)
        };
        match (was, now) {
            (false, true) => warn!("Disaster mode active: legacy backends disabled, mesh only"),
            (true, false) => info!("Disaster mode cleared: legacy backends re-enabled"),
            _ => {}
        }
        self.status()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soulmesh_discovery::StaticModeration;
    use soulmesh_reputation::{PeerMetricsService, ReputationConfig};
    use soulmesh_transfer::{DomainGate, PlannerConfig};

    fn disaster() -> (Arc<MultiSourcePlanner>, DisasterMode) {
        let planner = Arc::new(MultiSourcePlanner::new(
            Vec::new(),
            DomainGate::default(),
            Arc::new(StaticModeration::new()),
            Arc::new(PeerMetricsService::new(ReputationConfig::default())),
            PlannerConfig::default(),
        ));
        (planner.clone(), DisasterMode::new(planner))
    }

    #[test]
    fn unreachable_legacy_disables_its_backends() {
        let (planner, mode) = disaster();
        assert!(!mode.is_active());
        assert!(planner.is_backend_enabled(SourceBackend::Soulseek));

        let status = mode.report_legacy_reachable(false, 1_000);
        assert!(status.active);
        assert_eq!(status.active_since_ms, Some(1_000));
        assert!(!planner.is_backend_enabled(SourceBackend::Soulseek));
        assert!(planner.is_backend_enabled(SourceBackend::MeshDht));

        // Repeat reports keep the original start time.
        assert_eq!(mode.report_legacy_reachable(false, 2_000).active_since_ms, Some(1_000));

        mode.report_legacy_reachable(true, 3_000);
        assert!(!mode.is_active());
        assert!(planner.is_backend_enabled(SourceBackend::Soulseek));
    }

    #[test]
    fn operator_override_wins() {
        let (planner, mode) = disaster();
        mode.set_override(Some(true), 10);
        assert!(mode.is_active());
        assert!(!planner.is_backend_enabled(SourceBackend::Soulseek));

        mode.report_legacy_reachable(true, 20);
        assert!(mode.is_active());

        mode.report_legacy_reachable(false, 30);
        let status = mode.set_override(Some(false), 40);
        assert!(!status.active);
        assert!(!status.legacy_reachable);

        assert!(mode.set_override(None, 50).active);
    }
}
