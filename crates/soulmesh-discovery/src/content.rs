//! Content domains, backends and source candidates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// What kind of content an item is. Drives backend gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentDomain {
    Music,
    Video,
    Book,
    Software,
    Image,
}

impl ContentDomain {
    pub const ALL: [ContentDomain; 5] = [
        ContentDomain::Music,
        ContentDomain::Video,
        ContentDomain::Book,
        ContentDomain::Software,
        ContentDomain::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentDomain::Music => "music",
            ContentDomain::Video => "video",
            ContentDomain::Book => "book",
            ContentDomain::Software => "software",
            ContentDomain::Image => "image",
        }
    }
}

impl fmt::Display for ContentDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ContentDomain::ALL
            .into_iter()
            .find(|d| d.as_str() == lower)
            .ok_or_else(|| Error::UnknownDomain(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceBackend {
    LocalLibrary,
    MeshDht,
    /// The legacy centralized network.
    Soulseek,
    Http,
    Torrent,
}

impl SourceBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceBackend::LocalLibrary => "local_library",
            SourceBackend::MeshDht => "mesh_dht",
            SourceBackend::Soulseek => "soulseek",
            SourceBackend::Http => "http",
            SourceBackend::Torrent => "torrent",
        }
    }
}

impl fmt::Display for SourceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific locator for a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendRef {
    LocalPath { path: String },
    MeshPeer { peer_id: String, filename: String },
    Soulseek { username: String, filename: String },
    Url { url: String },
    Torrent { infohash: String, file_index: u32 },
}

impl BackendRef {
    pub fn backend(&self) -> SourceBackend {
        match self {
            BackendRef::LocalPath { .. } => SourceBackend::LocalLibrary,
            BackendRef::MeshPeer { .. } => SourceBackend::MeshDht,
            BackendRef::Soulseek { .. } => SourceBackend::Soulseek,
            BackendRef::Url { .. } => SourceBackend::Http,
            BackendRef::Torrent { .. } => SourceBackend::Torrent,
        }
    }
}

/// A discovered, not yet trusted source for an item.
///
/// Never mutated after creation. Rediscovery produces a new candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub id: Uuid,
    pub item_id: String,
    pub backend: SourceBackend,
    pub backend_ref: BackendRef,
    /// 0..=100
    pub expected_quality: u8,
    /// 0..=1
    pub trust_score: f64,
    pub size_bytes: Option<u64>,
    /// Logical recording this source resolves to, when known.
    pub recording_id: Option<String>,
    pub last_validated_at_ms: Option<u64>,
    pub last_seen_at_ms: u64,
    pub is_preferred: bool,
}

impl SourceCandidate {
    pub fn new(item_id: impl Into<String>, backend_ref: BackendRef, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            item_id: item_id.into(),
            backend: backend_ref.backend(),
            backend_ref,
            expected_quality: 50,
            trust_score: 0.5,
            size_bytes: None,
            recording_id: None,
            last_validated_at_ms: None,
            last_seen_at_ms: now_ms,
            is_preferred: false,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.expected_quality = quality.min(100);
        self
    }

    pub fn with_trust(mut self, trust: f64) -> Self {
        self.trust_score = trust.clamp(0.0, 1.0);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_recording(mut self, recording_id: impl Into<String>) -> Self {
        self.recording_id = Some(recording_id.into());
        self
    }

    pub fn validated_at(mut self, now_ms: u64) -> Self {
        self.last_validated_at_ms = Some(now_ms);
        self
    }

    pub fn preferred(mut self) -> Self {
        self.is_preferred = true;
        self
    }

    /// Peer or user behind this source, for reputation lookups.
    pub fn peer_id(&self) -> Option<&str> {
        match &self.backend_ref {
            BackendRef::MeshPeer { peer_id, .. } => Some(peer_id),
            BackendRef::Soulseek { username, .. } => Some(username),
            _ => None,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match &self.backend_ref {
            BackendRef::MeshPeer { filename, .. } | BackendRef::Soulseek { filename, .. } => {
                Some(filename)
            }
            BackendRef::LocalPath { path } => Some(path),
            _ => None,
        }
    }
}
