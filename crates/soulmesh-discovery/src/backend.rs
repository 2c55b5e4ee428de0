//! Candidate backends as a closed set.
//!
//! Every backend answers the same two questions: which sources exist for a
//! query, and is a given source still usable. Keeping the set closed lets
//! gating and filtering match on it exhaustively.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::content::{BackendRef, SourceBackend, SourceCandidate};
use crate::discovery::{ContentDiscovery, ContentQuery};
use crate::error::Result;
use crate::index::LibraryIndex;
use crate::matching::MatchType;
use crate::moderation::ModerationOracle;
use crate::now_ms;
use crate::quality::QualityScorer;

/// A source implemented outside this crate (legacy bridge, HTTP mirrors,
/// torrent client).
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn find_candidates(&self, query: &ContentQuery) -> Result<Vec<SourceCandidate>>;

    async fn validate_candidate(&self, _candidate: &SourceCandidate) -> bool {
        true
    }
}

pub struct LocalLibraryBackend {
    index: Arc<dyn LibraryIndex>,
    moderation: Arc<dyn ModerationOracle>,
    scorer: Arc<dyn QualityScorer>,
}

impl LocalLibraryBackend {
    pub fn new(
        index: Arc<dyn LibraryIndex>,
        moderation: Arc<dyn ModerationOracle>,
        scorer: Arc<dyn QualityScorer>,
    ) -> Self {
        Self { index, moderation, scorer }
    }

    fn find(&self, query: &ContentQuery) -> Result<Vec<SourceCandidate>> {
        let files = self.index.find(
            &query.item_id,
            query.recording_id.as_deref(),
            query.fingerprint.as_deref(),
        )?;
        let now = now_ms();
        Ok(files
            .into_iter()
            .filter(|f| {
                let allowed = self.moderation.is_allowed(&f.item_id);
                if !allowed {
                    debug!(item = %f.item_id, "Local file excluded by moderation");
                }
                allowed
            })
            .map(|f| {
                let mut c = SourceCandidate::new(&query.item_id, BackendRef::LocalPath { path: f.path.clone() }, now)
                    .with_quality(self.scorer.score(&f.filename, f.size))
                    .with_trust(1.0)
                    .with_size(f.size)
                    .validated_at(now)
                    .preferred();
                if let Some(rec) = f.recording_id {
                    c = c.with_recording(rec);
                }
                c
            })
            .collect())
    }

    fn validate(&self, candidate: &SourceCandidate) -> bool {
        match &candidate.backend_ref {
            BackendRef::LocalPath { path } => self.index.contains_path(path).unwrap_or(false),
            _ => false,
        }
    }
}

pub struct MeshBackend {
    discovery: Arc<ContentDiscovery>,
    scorer: Arc<dyn QualityScorer>,
}

impl MeshBackend {
    pub fn new(discovery: Arc<ContentDiscovery>, scorer: Arc<dyn QualityScorer>) -> Self {
        Self { discovery, scorer }
    }

    async fn find(&self, query: &ContentQuery, cancel: &CancellationToken) -> Vec<SourceCandidate> {
        let now = now_ms();
        self.discovery
            .discover_peers_for_content(query, cancel)
            .await
            .into_iter()
            .map(|d| {
                let recording = d.recording_id.clone().or_else(|| {
                    (d.match_type == MatchType::Exact)
                        .then(|| query.recording_id.clone())
                        .flatten()
                });
                let mut c = SourceCandidate::new(
                    &query.item_id,
                    BackendRef::MeshPeer {
                        peer_id: d.peer_id,
                        filename: d.filename.clone(),
                    },
                    now,
                )
                .with_quality(self.scorer.score(&d.filename, d.size))
                .with_trust(d.similarity_score)
                .with_size(d.size);
                if let Some(rec) = recording {
                    c = c.with_recording(rec);
                }
                c
            })
            .collect()
    }

    fn validate(&self, candidate: &SourceCandidate) -> bool {
        match &candidate.backend_ref {
            BackendRef::MeshPeer { peer_id, .. } => {
                self.discovery.reachable_peers().iter().any(|p| p == peer_id)
            }
            _ => false,
        }
    }
}

pub struct ExternalBackend {
    source: Arc<dyn CandidateSource>,
}

impl ExternalBackend {
    pub fn new(source: Arc<dyn CandidateSource>) -> Self {
        Self { source }
    }
}

pub enum Backend {
    LocalLibrary(LocalLibraryBackend),
    MeshDht(MeshBackend),
    Soulseek(ExternalBackend),
    Http(ExternalBackend),
    Torrent(ExternalBackend),
}

impl Backend {
    pub fn kind(&self) -> SourceBackend {
        match self {
            Backend::LocalLibrary(_) => SourceBackend::LocalLibrary,
            Backend::MeshDht(_) => SourceBackend::MeshDht,
            Backend::Soulseek(_) => SourceBackend::Soulseek,
            Backend::Http(_) => SourceBackend::Http,
            Backend::Torrent(_) => SourceBackend::Torrent,
        }
    }

    /// Candidates from this backend. Candidates an external source labels
    /// with a different backend are dropped.
    pub async fn find_candidates(
        &self,
        query: &ContentQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceCandidate>> {
        let kind = self.kind();
        let found = match self {
            Backend::LocalLibrary(b) => b.find(query)?,
            Backend::MeshDht(b) => b.find(query, cancel).await,
            Backend::Soulseek(b) | Backend::Http(b) | Backend::Torrent(b) => {
                tokio::select! {
                    _ = cancel.cancelled() => Vec::new(),
                    found = b.source.find_candidates(query) => found?,
                }
            }
        };
        let before = found.len();
        let found: Vec<SourceCandidate> = found
            .into_iter()
            .filter(|c| c.backend == kind && c.backend_ref.backend() == kind)
            .collect();
        if found.len() != before {
            warn!(backend = %kind, dropped = before - found.len(), "Backend returned mislabeled candidates");
        }
        Ok(found)
    }

    pub async fn validate_candidate(&self, candidate: &SourceCandidate) -> bool {
        if candidate.backend != self.kind() {
            return false;
        }
        match self {
            Backend::LocalLibrary(b) => b.validate(candidate),
            Backend::MeshDht(b) => b.validate(candidate),
            Backend::Soulseek(b) | Backend::Http(b) | Backend::Torrent(b) => {
                b.source.validate_candidate(candidate).await
            }
        }
    }
}

/// Fixed candidate list, for wiring external backends in tests and demos.
pub struct StaticCandidateSource {
    candidates: Vec<SourceCandidate>,
}

impl StaticCandidateSource {
    pub fn new(candidates: Vec<SourceCandidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn find_candidates(&self, query: &ContentQuery) -> Result<Vec<SourceCandidate>> {
        Ok(self
            .candidates
            .iter()
            .filter(|c| c.item_id == query.item_id)
            .cloned()
            .collect())
    }
}
