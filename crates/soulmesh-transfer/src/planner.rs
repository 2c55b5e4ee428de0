//! Multi-source planner.
//!
//! Planning runs a fixed pipeline: validate the domain, gather candidates
//! from every enabled backend, then apply the domain gate, moderation and
//! peer bans as hard filters. Whatever survives is ranked.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use soulmesh_discovery::{
    Backend, ContentDomain, ContentQuery, ModerationOracle, SourceBackend, SourceCandidate,
};
use soulmesh_reputation::PeerMetricsService;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::DomainGate;
use crate::plan::{RankedCandidate, TransferPlan, TransferRequest};

/// Relative weight of each ranking signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub trust: f64,
    pub quality: f64,
    pub backend: f64,
    pub peer: f64,
    pub prevalence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            trust: 0.25,
            quality: 0.25,
            backend: 0.15,
            peer: 0.25,
            prevalence: 0.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Rank mesh sources above the legacy network.
    pub prefer_mesh: bool,
    pub weights: ScoreWeights,
    /// Ask each backend to re-validate its own candidates.
    pub validate_candidates: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            prefer_mesh: true,
            weights: ScoreWeights::default(),
            validate_candidates: true,
        }
    }
}

impl PlannerConfig {
    pub fn with_prefer_mesh(mut self, prefer: bool) -> Self {
        self.prefer_mesh = prefer;
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_candidates = validate;
        self
    }
}

pub struct MultiSourcePlanner {
    backends: Vec<Backend>,
    gate: DomainGate,
    moderation: Arc<dyn ModerationOracle>,
    metrics: Arc<PeerMetricsService>,
    config: PlannerConfig,
    disabled: RwLock<HashSet<SourceBackend>>,
}

impl MultiSourcePlanner {
    pub fn new(
        backends: Vec<Backend>,
        gate: DomainGate,
        moderation: Arc<dyn ModerationOracle>,
        metrics: Arc<PeerMetricsService>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            backends,
            gate,
            moderation,
            metrics,
            config,
            disabled: RwLock::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PeerMetricsService> {
        &self.metrics
    }

    pub fn backend_kinds(&self) -> Vec<SourceBackend> {
        self.backends.iter().map(Backend::kind).collect()
    }

    /// Turn a backend off or on without rebuilding the planner.
    pub fn set_backend_enabled(&self, backend: SourceBackend, enabled: bool) {
        let mut disabled = self.disabled.write().unwrap_or_else(|p| p.into_inner());
        let changed = if enabled {
            disabled.remove(&backend)
        } else {
            disabled.insert(backend)
        };
        if changed {
            info!(%backend, enabled, "Planner backend toggled");
        }
    }

    pub fn is_backend_enabled(&self, backend: SourceBackend) -> bool {
        !self
            .disabled
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&backend)
    }

    /// Build a fresh plan for `request`.
    pub async fn plan(&self, request: &TransferRequest, cancel: &CancellationToken) -> TransferPlan {
        let mut plan = TransferPlan::new(&request.item_id);
        self.fill(&mut plan, request, cancel).await;
        plan
    }

    /// Re-run planning into an existing plan (Pending or Planned).
    pub async fn replan(&self, plan: &mut TransferPlan, request: &TransferRequest, cancel: &CancellationToken) {
        self.fill(plan, request, cancel).await;
    }

    async fn fill(&self, plan: &mut TransferPlan, request: &TransferRequest, cancel: &CancellationToken) {
        let domain = match request.domain.parse::<ContentDomain>() {
            Ok(d) => d,
            Err(e) => {
                warn!(item = %request.item_id, domain = %request.domain, "Rejecting plan");
                plan.mark_failed(format!("Domain validation failed: {e}"));
                return;
            }
        };
        plan.domain = Some(domain);
        if request.item_id.trim().is_empty() {
            plan.mark_failed("Invalid request: item id is empty");
            return;
        }

        let mut query = ContentQuery::new(&request.item_id, &request.filename, request.file_size, domain);
        query.recording_id = request.recording_id.clone();
        query.fingerprint = request.fingerprint.clone();

        let gathered = self.gather(&query, cancel).await;
        if cancel.is_cancelled() {
            plan.mark_cancelled();
            return;
        }

        let total = gathered.len();
        let usable: Vec<SourceCandidate> = gathered
            .into_iter()
            .filter(|c| self.gate.allows(c.backend, domain))
            .filter(|c| self.moderation.is_allowed(&c.item_id))
            .filter(|c| !c.peer_id().is_some_and(|p| self.metrics.is_peer_banned(p)))
            .collect();
        debug!(item = %request.item_id, total, usable = usable.len(), "Candidates filtered");

        if usable.is_empty() {
            plan.mark_failed(format!("No usable sources for {}", request.item_id));
            return;
        }

        let ranked = self.rank(usable);
        info!(
            item = %request.item_id,
            candidates = ranked.len(),
            best = ?ranked.first().map(|r| r.candidate.backend),
            "Plan ready"
        );
        plan.mark_planned(ranked);
    }

    async fn gather(&self, query: &ContentQuery, cancel: &CancellationToken) -> Vec<SourceCandidate> {
        let searches = self
            .backends
            .iter()
            .filter(|b| self.is_backend_enabled(b.kind()))
            .map(|backend| async move {
                match backend.find_candidates(query, cancel).await {
                    Ok(found) if self.config.validate_candidates => {
                        let checks = join_all(found.iter().map(|c| backend.validate_candidate(c))).await;
                        found
                            .into_iter()
                            .zip(checks)
                            .filter_map(|(c, ok)| ok.then_some(c))
                            .collect()
                    }
                    Ok(found) => found,
                    Err(e) => {
                        warn!(backend = %backend.kind(), error = %e, "Backend search failed");
                        Vec::new()
                    }
                }
            });
        join_all(searches).await.into_iter().flatten().collect()
    }

    fn backend_preference(&self, backend: SourceBackend) -> f64 {
        match (backend, self.config.prefer_mesh) {
            (SourceBackend::LocalLibrary, _) => 1.0,
            (SourceBackend::MeshDht, true) | (SourceBackend::Soulseek, false) => 0.8,
            (SourceBackend::MeshDht, false) | (SourceBackend::Soulseek, true) => 0.5,
            (SourceBackend::Http, _) | (SourceBackend::Torrent, _) => 0.4,
        }
    }

    /// Score and order candidates, best first.
    pub fn rank(&self, candidates: Vec<SourceCandidate>) -> Vec<RankedCandidate> {
        let w = self.config.weights;
        let total_weight = (w.trust + w.quality + w.backend + w.peer + w.prevalence).max(f64::EPSILON);

        let mut prevalence: HashMap<(Option<&str>, Option<u64>), usize> = HashMap::new();
        for c in &candidates {
            *prevalence.entry(variant_key(c)).or_default() += 1;
        }
        let max_prevalence = prevalence.values().copied().max().unwrap_or(1).max(1) as f64;

        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .map(|c| {
                let peer = match (c.backend, c.peer_id()) {
                    (SourceBackend::LocalLibrary, _) => 1.0,
                    (_, Some(peer)) => self.metrics.ranking_score(peer),
                    (_, None) => soulmesh_reputation::NEUTRAL_SCORE,
                };
                let seen = prevalence.get(&variant_key(c)).copied().unwrap_or(1) as f64;
                let raw = w.trust * c.trust_score
                    + w.quality * f64::from(c.expected_quality) / 100.0
                    + w.backend * self.backend_preference(c.backend)
                    + w.peer * peer
                    + w.prevalence * seen / max_prevalence;
                let preferred = if c.is_preferred { 0.01 } else { 0.0 };
                (raw / total_weight + preferred, c)
            })
            .map(|(score, c)| RankedCandidate {
                candidate: c.clone(),
                score,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.candidate.backend.cmp(&b.candidate.backend))
                .then_with(|| a.candidate.peer_id().cmp(&b.candidate.peer_id()))
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });
        ranked
    }
}

/// Candidates sharing a recording and size are the same variant.
pub(crate) fn variant_key(c: &SourceCandidate) -> (Option<&str>, Option<u64>) {
    (c.recording_id.as_deref().or(Some(c.item_id.as_str())), c.size_bytes)
}
