//! HTTP control API for the node.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use soulmesh_gossip::GossipService;
use soulmesh_overlay::NeighborRegistry;
use soulmesh_reputation::{PeerMetricsService, PeerPerformanceMetrics};
use soulmesh_search::{
    federated_search, ActionRouter, ActionTicket, AggregatedResult, AggregatorConfig, SearchAction, SearchProvider,
};
use soulmesh_transfer::{AudioVariant, CanonicalStats, LibraryHealth};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::actions::NodeActionTarget;
use crate::disaster::{DisasterMode, DisasterStatus};
use crate::error::Error;
use crate::jobs::{CreateJobRequest, Job, JobQueue, JobStatus};
use crate::storage::Storage;

/// Gossip topic announcing a variant observation.
pub const VARIANT_SEEN: &str = "variant_seen";

const DEFAULT_RANKED_LIMIT: usize = 20;
const MAX_RANKED_LIMIT: usize = 500;

/// Shared handles the API reads and drives.
pub struct ApiState {
    pub storage: Arc<Storage>,
    pub registry: Arc<NeighborRegistry>,
    pub metrics: Arc<PeerMetricsService>,
    pub disaster: Arc<DisasterMode>,
    pub gossip: GossipService,
    pub jobs: JobQueue,
    pub search_providers: Vec<Arc<dyn SearchProvider>>,
    pub search_timeout: Duration,
    pub local_peer_id: String,
}

type AppState = Arc<ApiState>;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Disaster mode
        .route("/api/v1/disaster-mode", get(get_disaster_mode).post(set_disaster_override))
        .route("/api/v1/disaster-mode/legacy", post(report_legacy))
        // Variant catalog
        .route("/api/v1/recordings/:id/canonical", get(get_canonical))
        .route("/api/v1/recordings/:id/variants", post(record_variant))
        .route("/api/v1/library/health", get(get_library_health))
        // Jobs
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        // Search
        .route("/api/v1/search", get(search))
        .route("/api/v1/search/actions", post(dispatch_action))
        // Mesh
        .route("/api/v1/neighbors", get(list_neighbors))
        .route("/api/v1/peers/ranked", get(ranked_peers))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn internal(e: Error) -> StatusCode {
    error!("API storage error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

// --- Health ---

async fn health() -> &'static str {
    "OK"
}

// --- Disaster mode ---

async fn get_disaster_mode(State(state): State<AppState>) -> Json<DisasterStatus> {
    Json(state.disaster.status())
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    /// `true`/`false` forces the mode; `null` follows reachability again.
    #[serde(rename = "override")]
    forced: Option<bool>,
}

async fn set_disaster_override(
    State(state): State<AppState>,
    Json(req): Json<OverrideRequest>,
) -> Json<DisasterStatus> {
    warn!(forced = ?req.forced, "Operator changed disaster mode override");
    Json(state.disaster.set_override(req.forced, soulmesh_dht::now_ms()))
}

#[derive(Debug, Deserialize)]
struct LegacyReport {
    reachable: bool,
}

async fn report_legacy(
    State(state): State<AppState>,
    Json(req): Json<LegacyReport>,
) -> Json<DisasterStatus> {
    Json(state.disaster.report_legacy_reachable(req.reachable, soulmesh_dht::now_ms()))
}

// --- Variant catalog ---

async fn get_canonical(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CanonicalStats>, StatusCode> {
    match state.storage.canonical_stats(&id) {
        Ok(Some(stats)) => Ok(Json(stats)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal(e)),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VariantReport {
    pub variant_id: String,
    pub codec: String,
    pub sample_rate_hz: u32,
    #[serde(default)]
    pub bit_depth: Option<u8>,
    #[serde(default)]
    pub channels: Option<u8>,
    pub bitrate_kbps: u32,
}

impl VariantReport {
    pub fn into_variant(self, recording_id: &str) -> AudioVariant {
        let variant = AudioVariant::new(
            self.variant_id,
            recording_id,
            self.codec,
            self.sample_rate_hz,
            self.bit_depth,
            self.bitrate_kbps,
        );
        match self.channels {
            Some(c) => variant.with_channels(c),
            None => variant,
        }
    }
}

/// Record a local observation and announce it to the mesh.
async fn record_variant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<VariantReport>,
) -> Result<(StatusCode, Json<AudioVariant>), StatusCode> {
    if id.trim().is_empty() || report.variant_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let variant = report.into_variant(&id);
    let stored = state.storage.record_variant(&variant).map_err(internal)?;

    let now = soulmesh_dht::now_ms();
    match serde_json::to_value(&variant) {
        Ok(payload) => {
            let message = state.gossip.create_message(VARIANT_SEEN, payload, now);
            if let Err(e) = state.gossip.publish(message, now) {
                warn!(recording = %id, "Variant announcement not published: {}", e);
            }
        }
        Err(e) => warn!(recording = %id, "Variant not encodable for gossip: {}", e),
    }
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_library_health(State(state): State<AppState>) -> Result<Json<LibraryHealth>, StatusCode> {
    state.storage.library_health().map(Json).map_err(internal)
}

// --- Jobs ---

#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    job: Job,
    status: JobStatus,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let status = job.status();
        Self { job, status }
    }
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobView>), (StatusCode, String)> {
    match state.jobs.submit(&state.storage, req, soulmesh_dht::now_ms()).await {
        Ok(job) => Ok((StatusCode::CREATED, Json(job.into()))),
        Err(Error::InvalidInput(reason)) => Err((StatusCode::BAD_REQUEST, reason)),
        Err(e) => Err((internal(e), "storage error".to_string())),
    }
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, StatusCode> {
    match state.storage.get_job(&id) {
        Ok(Some(job)) => Ok(Json(job.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal(e)),
    }
}

// --- Search ---

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<AggregatedResult>>, StatusCode> {
    if query.q.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let results = federated_search(
        &state.search_providers,
        &query.q,
        AggregatorConfig::default(),
        state.search_timeout,
        &CancellationToken::new(),
    )
    .await;
    Ok(Json(results))
}

fn default_action() -> SearchAction {
    SearchAction::Download
}

fn default_domain() -> String {
    "music".to_string()
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    result: AggregatedResult,
    #[serde(default = "default_action")]
    action: SearchAction,
    #[serde(default = "default_domain")]
    domain: String,
}

/// Route a search result to the path that owns it.
async fn dispatch_action(
    State(state): State<AppState>,
    Json(req): Json<ActionRequest>,
) -> Result<(StatusCode, Json<ActionTicket>), (StatusCode, String)> {
    let target = NodeActionTarget::new(Arc::clone(&state.storage), state.jobs.clone(), req.domain);
    let router = ActionRouter::new(Arc::new(target));
    match router.dispatch(&req.result, req.action).await {
        Ok(ticket) => Ok((StatusCode::ACCEPTED, Json(ticket))),
        Err(e) => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

// --- Mesh ---

#[derive(Debug, Serialize)]
struct NeighborView {
    peer_id: String,
    remote_addr: String,
    connected_secs: u64,
    latency_ms: Option<u64>,
    reputation: f64,
}

#[derive(Debug, Serialize)]
struct NeighborsResponse {
    local_peer_id: String,
    min_neighbors: usize,
    max_neighbors: usize,
    neighbors: Vec<NeighborView>,
}

async fn list_neighbors(State(state): State<AppState>) -> Json<NeighborsResponse> {
    let limits = state.registry.limits();
    let mut neighbors: Vec<NeighborView> = state
        .registry
        .neighbors()
        .into_iter()
        .map(|n| NeighborView {
            reputation: state.metrics.ranking_score(&n.peer_id),
            remote_addr: n.remote_addr.to_string(),
            connected_secs: n.established_at.elapsed().as_secs(),
            latency_ms: n.latency.map(|l| l.as_millis() as u64),
            peer_id: n.peer_id,
        })
        .collect();
    neighbors.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    Json(NeighborsResponse {
        local_peer_id: state.local_peer_id.clone(),
        min_neighbors: limits.min_neighbors,
        max_neighbors: limits.max_neighbors,
        neighbors,
    })
}

#[derive(Debug, Deserialize)]
struct RankedQuery {
    limit: Option<usize>,
}

async fn ranked_peers(
    State(state): State<AppState>,
    Query(query): Query<RankedQuery>,
) -> Json<Vec<PeerPerformanceMetrics>> {
    let limit = query.limit.unwrap_or(DEFAULT_RANKED_LIMIT).clamp(1, MAX_RANKED_LIMIT);
    Json(state.metrics.get_ranked_peers(limit))
}
