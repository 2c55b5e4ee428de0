//! Mesh content discovery.
//!
//! Fans a query out to every reachable peer as search requests, validates
//! each response, and classifies every returned file against the query.
//! One slow or broken peer never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::ContentDomain;
use crate::matching::{classify, normalize_stem, MatchSignals, MatchType};
use crate::search::{SearchFile, SearchRequest, MAX_RESULTS, MAX_SEARCH_TEXT_LEN};
use crate::transport::SearchTransport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentQuery {
    pub item_id: String,
    pub filename: String,
    pub file_size: u64,
    pub domain: ContentDomain,
    pub recording_id: Option<String>,
    pub fingerprint: Option<String>,
    /// Results below this similarity are dropped.
    pub min_similarity: f64,
}

impl ContentQuery {
    pub fn new(
        item_id: impl Into<String>,
        filename: impl Into<String>,
        file_size: u64,
        domain: ContentDomain,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            filename: filename.into(),
            file_size,
            domain,
            recording_id: None,
            fingerprint: None,
            min_similarity: 0.0,
        }
    }

    pub fn with_recording(mut self, recording_id: impl Into<String>) -> Self {
        self.recording_id = Some(recording_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_min_similarity(mut self, min: f64) -> Self {
        self.min_similarity = min.clamp(0.0, 1.0);
        self
    }

    fn signals(&self) -> MatchSignals<'_> {
        MatchSignals {
            filename: &self.filename,
            size: self.file_size,
            recording_id: self.recording_id.as_deref(),
            fingerprint: self.fingerprint.as_deref(),
        }
    }

    /// Search texts to send: the filename stem, then the recording id.
    fn search_texts(&self) -> Vec<String> {
        let mut texts = Vec::with_capacity(2);
        let stem: String = normalize_stem(&self.filename)
            .chars()
            .take(MAX_SEARCH_TEXT_LEN)
            .collect();
        if !stem.is_empty() {
            texts.push(stem);
        }
        if let Some(rec) = self.recording_id.as_deref().filter(|r| !r.is_empty()) {
            texts.push(rec.chars().take(MAX_SEARCH_TEXT_LEN).collect());
        }
        texts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub peer_id: String,
    pub filename: String,
    pub size: u64,
    pub similarity_score: f64,
    pub match_type: MatchType,
    pub metadata_confidence: f64,
    pub recording_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_results_per_peer: i64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_results_per_peer: 25,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_max_results_per_peer(mut self, n: i64) -> Self {
        self.max_results_per_peer = n.clamp(1, MAX_RESULTS);
        self
    }
}

pub struct ContentDiscovery {
    transport: Arc<dyn SearchTransport>,
    config: DiscoveryConfig,
}

impl ContentDiscovery {
    pub fn new(transport: Arc<dyn SearchTransport>, config: DiscoveryConfig) -> Self {
        Self { transport, config }
    }

    pub fn reachable_peers(&self) -> Vec<String> {
        self.transport.peers()
    }

    /// Ranked matches across reachable peers: match type first, then
    /// similarity. Empty when cancelled.
    pub async fn discover_peers_for_content(
        &self,
        query: &ContentQuery,
        cancel: &CancellationToken,
    ) -> Vec<DiscoveredPeer> {
        let peers = self.transport.peers();
        let texts = query.search_texts();
        if peers.is_empty() || texts.is_empty() {
            return Vec::new();
        }

        let requests = peers.iter().flat_map(|peer| {
            texts.iter().map(move |text| {
                let request = SearchRequest::new(text.clone(), self.config.max_results_per_peer);
                self.query_peer(peer.clone(), request)
            })
        });

        let responses = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(item = %query.item_id, "Discovery cancelled");
                return Vec::new();
            }
            responses = join_all(requests) => responses,
        };

        let wanted = query.signals();
        let mut best: HashMap<(String, String), DiscoveredPeer> = HashMap::new();
        for (peer, files) in responses.into_iter().flatten() {
            for file in files {
                let Ok(size) = u64::try_from(file.size) else {
                    continue;
                };
                let found = MatchSignals {
                    filename: &file.filename,
                    size,
                    recording_id: file.recording_id.as_deref(),
                    fingerprint: file.fingerprint.as_deref(),
                };
                let Some(m) = classify(&wanted, &found) else {
                    continue;
                };
                if m.similarity < query.min_similarity {
                    continue;
                }
                let candidate = DiscoveredPeer {
                    peer_id: peer.clone(),
                    filename: file.filename.clone(),
                    size,
                    similarity_score: m.similarity,
                    match_type: m.match_type,
                    metadata_confidence: m.metadata_confidence,
                    recording_id: file.recording_id.clone(),
                };
                let key = (peer.clone(), file.filename.clone());
                match best.get(&key) {
                    Some(existing) if !is_better(&candidate, existing) => {}
                    _ => {
                        best.insert(key, candidate);
                    }
                }
            }
        }

        let mut found: Vec<DiscoveredPeer> = best.into_values().collect();
        found.sort_by(|a, b| {
            a.match_type
                .rank()
                .cmp(&b.match_type.rank())
                .then_with(|| b.similarity_score.total_cmp(&a.similarity_score))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
                .then_with(|| a.filename.cmp(&b.filename))
        });
        info!(item = %query.item_id, peers = peers.len(), matches = found.len(), "Content discovery finished");
        found
    }

    /// `None` on transport failure or an invalid response.
    async fn query_peer(&self, peer: String, request: SearchRequest) -> Option<(String, Vec<SearchFile>)> {
        let request_id = request.request_id.clone();
        let response = match self.transport.search(&peer, request).await {
            Ok(r) => r,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Search request failed");
                return None;
            }
        };
        if response.request_id != request_id {
            warn!(peer = %peer, "Search response for a different request");
            return None;
        }
        if let Err(e) = response.validate() {
            warn!(peer = %peer, "Invalid search response: {}", e);
            return None;
        }
        if let Some(err) = &response.error {
            debug!(peer = %peer, "Peer reported search error: {}", err);
        }
        Some((peer, response.files))
    }
}

fn is_better(a: &DiscoveredPeer, b: &DiscoveredPeer) -> bool {
    (a.match_type.rank(), std::cmp::Reverse(ordered(a.similarity_score)))
        < (b.match_type.rank(), std::cmp::Reverse(ordered(b.similarity_score)))
}

fn ordered(x: f64) -> u64 {
    (x.clamp(0.0, 1.0) * 1e9) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::index::{IndexedFile, LibraryIndex, MemoryLibraryIndex};
    use crate::search::{LocalSearchHandler, SearchResponse};
    use async_trait::async_trait;

    /// Peers answered by local handlers; some peers can misbehave.
    struct FakeMesh {
        peers: HashMap<String, LocalSearchHandler>,
        down: Vec<String>,
        liar: Option<String>,
    }

    #[async_trait]
    impl SearchTransport for FakeMesh {
        fn peers(&self) -> Vec<String> {
            let mut p: Vec<String> = self.peers.keys().cloned().collect();
            p.extend(self.down.iter().cloned());
            p.sort();
            p
        }

        async fn search(&self, peer_id: &str, request: SearchRequest) -> Result<SearchResponse> {
            if self.down.iter().any(|d| d == peer_id) {
                return Err(Error::BackendUnavailable { backend: "mesh".into(), reason: "down".into() });
            }
            let mut response = self.peers[peer_id].handle(&request);
            if self.liar.as_deref() == Some(peer_id) {
                for f in &mut response.files {
                    f.size = -1;
                }
            }
            Ok(response)
        }
    }

    fn handler(files: Vec<IndexedFile>) -> LocalSearchHandler {
        let index: Arc<dyn LibraryIndex> = Arc::new(MemoryLibraryIndex::with_files(files));
        LocalSearchHandler::new(index)
    }

    fn mesh() -> FakeMesh {
        let mut peers = HashMap::new();
        peers.insert(
            "peer-b".to_string(),
            handler(vec![IndexedFile::new("x-b", "/m/Artist - Track.flac", 30_000_000).with_recording("rec-x")]),
        );
        peers.insert(
            "peer-c".to_string(),
            handler(vec![IndexedFile::new("x-c", "/m/artist_track_320.mp3", 9_000_000).with_recording("rec-x")]),
        );
        peers.insert(
            "peer-d".to_string(),
            handler(vec![IndexedFile::new("x-d", "/m/Artist - Track.mp3", 1234)]),
        );
        peers.insert(
            "peer-e".to_string(),
            handler(vec![IndexedFile::new("x-e", "/m/Artist - Track.mp3", 1234)]),
        );
        FakeMesh { peers, down: vec!["peer-down".into()], liar: Some("peer-e".into()) }
    }

    #[tokio::test]
    async fn classifies_and_ranks_across_peers() {
        let discovery = ContentDiscovery::new(Arc::new(mesh()), DiscoveryConfig::default());
        let query = ContentQuery::new("x", "Artist - Track.mp3", 1234, ContentDomain::Music).with_recording("rec-x");
        let found = discovery.discover_peers_for_content(&query, &CancellationToken::new()).await;

        let summary: Vec<(&str, MatchType)> = found.iter().map(|d| (d.peer_id.as_str(), d.match_type)).collect();
        assert_eq!(
            summary,
            vec![
                ("peer-d", MatchType::Exact),
                ("peer-b", MatchType::Metadata),
                ("peer-c", MatchType::Metadata),
            ]
        );
        assert_eq!(found[1].metadata_confidence, crate::matching::METADATA_CONFIDENCE);
    }

    #[tokio::test]
    async fn min_similarity_filters() {
        let discovery = ContentDiscovery::new(Arc::new(mesh()), DiscoveryConfig::default());
        let query = ContentQuery::new("x", "Artist - Track.mp3", 1234, ContentDomain::Music)
            .with_recording("rec-x")
            .with_min_similarity(0.9);
        let found = discovery.discover_peers_for_content(&query, &CancellationToken::new()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].match_type, MatchType::Exact);
    }

    #[tokio::test]
    async fn cancelled_discovery_is_empty() {
        let discovery = ContentDiscovery::new(Arc::new(mesh()), DiscoveryConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let query = ContentQuery::new("x", "Artist - Track.mp3", 1234, ContentDomain::Music);
        assert!(discovery.discover_peers_for_content(&query, &cancel).await.is_empty());
    }
}
