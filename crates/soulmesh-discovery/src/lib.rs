//! Soulmesh Discovery
//!
//! Finds sources for content across backends and answers remote search
//! requests from the local library.
//!
//! # Design
//!
//! - Backends form a closed [`Backend`] enum with two operations,
//!   `find_candidates` and `validate_candidate`.
//! - Mesh discovery fans search requests to every neighbor and classifies
//!   results as `Exact` (filename and size), `Metadata` (recording id or
//!   fingerprint) or `Variant` (fuzzy filename).
//! - Search messages are validated at the boundary with a specific reason.
//!   A failing index still produces a well-formed, empty response.
//! - Moderation fails closed: an item with no verdict is never offered.

mod backend;
mod content;
mod discovery;
mod error;
mod index;
mod matching;
mod moderation;
mod quality;
mod search;
mod transport;

use std::time::{SystemTime, UNIX_EPOCH};

pub use backend::{
    Backend, CandidateSource, ExternalBackend, LocalLibraryBackend, MeshBackend,
    StaticCandidateSource,
};
pub use content::{BackendRef, ContentDomain, SourceBackend, SourceCandidate};
pub use discovery::{ContentDiscovery, ContentQuery, DiscoveredPeer, DiscoveryConfig};
pub use error::{Error, Result};
pub use index::{IndexedFile, LibraryIndex, MemoryLibraryIndex};
pub use matching::{
    classify, filename_similarity, normalize_stem, MatchResult, MatchSignals, MatchType,
    METADATA_CONFIDENCE, METADATA_CONFIDENCE_BOTH, VARIANT_THRESHOLD,
};
pub use moderation::{ModerationOracle, ModerationVerdict, StaticModeration};
pub use quality::{ExtensionQualityScorer, QualityScorer};
pub use search::{
    LocalSearchHandler, SearchFile, SearchRequest, SearchResponse, SearchValidationError,
    MAX_RESPONSE_FILES, MAX_RESULTS, MAX_SEARCH_TEXT_LEN, MIN_RESULTS,
};
pub use transport::{OverlaySearchTransport, SearchTransport};

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
