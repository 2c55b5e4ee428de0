//! Merging search results from several providers.
//!
//! Results are keyed by normalized `(filename, size)`. The peer or username
//! that offered a file is deliberately not part of the key: the same file
//! shows up under different identities on different providers, and the
//! merged result keeps every reference it has seen.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MESH_PROVIDER: &str = "mesh";
pub const LEGACY_PROVIDER: &str = "legacy-network";

/// One file as reported by one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHit {
    pub filename: String,
    pub size: u64,
    /// Legacy-network user offering the file.
    pub username: Option<String>,
    /// Mesh peer offering the file.
    pub peer_id: Option<String>,
    /// Mesh content id (item id) used to fetch from `peer_id`.
    pub content_id: Option<String>,
}

impl ProviderHit {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
            username: None,
            peer_id: None,
            content_id: None,
        }
    }

    pub fn from_user(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn from_peer(mut self, peer_id: impl Into<String>, content_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self.content_id = Some(content_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Filename as first reported.
    pub filename: String,
    pub size: u64,
    pub source_providers: BTreeSet<String>,
    pub primary_source: String,
    pub username: Option<String>,
    pub peer_id: Option<String>,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Provider that becomes primary whenever it supplied a result.
    pub preferred_provider: String,
    /// Distinct results kept; later new keys are dropped.
    pub max_results: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            preferred_provider: MESH_PROVIDER.to_string(),
            max_results: 1000,
        }
    }
}

impl AggregatorConfig {
    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = provider.into();
        self
    }

    pub fn with_max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }
}

/// Basename, lowercased, with whitespace collapsed. Handles both `/` and
/// the legacy network's `\` separators.
pub fn normalize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);
    base.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

type ResultKey = (String, u64);

/// Accumulates results from any number of providers.
#[derive(Debug, Default)]
pub struct SearchAggregator {
    config: AggregatorConfig,
    index: HashMap<ResultKey, usize>,
    results: Vec<AggregatedResult>,
}

impl SearchAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            index: HashMap::new(),
            results: Vec::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Merge one provider's hits.
    pub fn add(&mut self, provider: &str, hits: impl IntoIterator<Item = ProviderHit>) {
        let mut merged = 0usize;
        let mut dropped = 0usize;
        for hit in hits {
            let key = (normalize_filename(&hit.filename), hit.size);
            if key.0.is_empty() {
                dropped += 1;
                continue;
            }
            match self.index.get(&key) {
                Some(&i) => {
                    self.merge(i, provider, hit);
                    merged += 1;
                }
                None if self.results.len() >= self.config.max_results => dropped += 1,
                None => {
                    self.index.insert(key, self.results.len());
                    self.results.push(AggregatedResult {
                        filename: hit.filename,
                        size: hit.size,
                        source_providers: BTreeSet::from([provider.to_string()]),
                        primary_source: provider.to_string(),
                        username: hit.username,
                        peer_id: hit.peer_id,
                        content_id: hit.content_id,
                    });
                }
            }
        }
        debug!(provider, merged, dropped, total = self.results.len(), "Merged provider results");
    }

    fn merge(&mut self, i: usize, provider: &str, hit: ProviderHit) {
        let preferred = self.config.preferred_provider.as_str();
        let result = &mut self.results[i];
        result.source_providers.insert(provider.to_string());
        if provider == preferred {
            result.primary_source = preferred.to_string();
        }
        // References only fill gaps; the first provider's stay authoritative.
        if result.username.is_none() {
            result.username = hit.username;
        }
        if result.peer_id.is_none() {
            result.peer_id = hit.peer_id;
        }
        if result.content_id.is_none() {
            result.content_id = hit.content_id;
        }
    }

    /// Merged results in first-seen order.
    pub fn results(&self) -> &[AggregatedResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<AggregatedResult> {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(normalize_filename("Music\\Artist\\01  Song.FLAC"), "01 song.flac");
        assert_eq!(normalize_filename("/srv/music/01 Song.flac"), "01 song.flac");
        assert_eq!(normalize_filename(""), "");
    }

    #[test]
    fn duplicates_merge_across_identities() {
        let mut agg = SearchAggregator::new(AggregatorConfig::default());
        agg.add(LEGACY_PROVIDER, [
            ProviderHit::new("Music\\Artist\\Song.flac", 100).from_user("alice"),
            ProviderHit::new("Other.mp3", 5).from_user("alice"),
        ]);
        agg.add(MESH_PROVIDER, [ProviderHit::new("song.flac", 100).from_peer("peer-b", "item-1")]);

        assert_eq!(agg.len(), 2);
        let song = &agg.results()[0];
        assert_eq!(song.source_providers.len(), 2);
        assert_eq!(song.primary_source, MESH_PROVIDER);
        assert_eq!(song.username.as_deref(), Some("alice"));
        assert_eq!(song.peer_id.as_deref(), Some("peer-b"));
        assert_eq!(agg.results()[1].primary_source, LEGACY_PROVIDER);
    }

    #[test]
    fn size_is_part_of_the_key() {
        let mut agg = SearchAggregator::new(AggregatorConfig::default());
        agg.add(MESH_PROVIDER, [ProviderHit::new("a.flac", 1)]);
        agg.add(LEGACY_PROVIDER, [ProviderHit::new("a.flac", 2)]);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn first_provider_is_primary_without_preference() {
        let mut agg = SearchAggregator::new(AggregatorConfig::default().with_preferred_provider("torrent"));
        agg.add(LEGACY_PROVIDER, [ProviderHit::new("a.flac", 1)]);
        agg.add(MESH_PROVIDER, [ProviderHit::new("a.flac", 1)]);
        assert_eq!(agg.results()[0].primary_source, LEGACY_PROVIDER);
    }

    #[test]
    fn result_cap_only_blocks_new_keys() {
        let mut agg = SearchAggregator::new(AggregatorConfig::default().with_max_results(1));
        agg.add(LEGACY_PROVIDER, [ProviderHit::new("a", 1), ProviderHit::new("b", 1)]);
        agg.add(MESH_PROVIDER, [ProviderHit::new("a", 1)]);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.results()[0].source_providers.len(), 2);
    }
}
