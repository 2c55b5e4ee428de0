//! Local library index seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matching::normalize_stem;

/// A file shared from the local library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub item_id: String,
    pub path: String,
    pub filename: String,
    pub size: u64,
    pub recording_id: Option<String>,
    pub fingerprint: Option<String>,
}

impl IndexedFile {
    pub fn new(item_id: impl Into<String>, path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let filename = path.rsplit(['/', '\\']).next().unwrap_or(&path).to_string();
        Self {
            item_id: item_id.into(),
            path,
            filename,
            size,
            recording_id: None,
            fingerprint: None,
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

    /// Every query token appears in the filename, or the query is this
    /// file's recording id or fingerprint.
    pub fn matches_text(&self, text: &str) -> bool {
        let query = text.trim();
        if query.is_empty() {
            return false;
        }
        let eq = |v: &Option<String>| v.as_deref().is_some_and(|v| v.eq_ignore_ascii_case(query));
        if eq(&self.recording_id) || eq(&self.fingerprint) || self.item_id == query {
            return true;
        }
        let haystack = normalize_stem(&self.filename);
        let needle = normalize_stem(query);
        let words: Vec<&str> = haystack.split_whitespace().collect();
        !needle.is_empty() && needle.split_whitespace().all(|t| words.contains(&t))
    }
}

pub trait LibraryIndex: Send + Sync {
    /// Files matching free text, in no particular order.
    fn search(&self, text: &str) -> Result<Vec<IndexedFile>>;

    /// Files for an item, recording or fingerprint.
    fn find(&self, item_id: &str, recording_id: Option<&str>, fingerprint: Option<&str>)
        -> Result<Vec<IndexedFile>>;

    fn contains_path(&self, path: &str) -> Result<bool>;
}

/// In-memory index.
#[derive(Default)]
pub struct MemoryLibraryIndex {
    files: RwLock<Vec<IndexedFile>>,
    failing: AtomicBool,
}

impl MemoryLibraryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: impl IntoIterator<Item = IndexedFile>) -> Self {
        let index = Self::new();
        for f in files {
            index.add(f);
        }
        index
    }

    pub fn add(&self, file: IndexedFile) {
        let mut files = self.files.write().unwrap_or_else(|p| p.into_inner());
        files.retain(|f| f.path != file.path);
        files.push(file);
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every query fail, to exercise error paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Index("index unavailable".to_string()));
        }
        Ok(())
    }
}

impl LibraryIndex for MemoryLibraryIndex {
    fn search(&self, text: &str) -> Result<Vec<IndexedFile>> {
        self.check()?;
        let files = self.files.read().unwrap_or_else(|p| p.into_inner());
        Ok(files.iter().filter(|f| f.matches_text(text)).cloned().collect())
    }

    fn find(
        &self,
        item_id: &str,
        recording_id: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<Vec<IndexedFile>> {
        self.check()?;
        let files = self.files.read().unwrap_or_else(|p| p.into_inner());
        let eq = |a: &Option<String>, b: Option<&str>| matches!((a.as_deref(), b), (Some(x), Some(y)) if x == y);
        Ok(files
            .iter()
            .filter(|f| f.item_id == item_id || eq(&f.recording_id, recording_id) || eq(&f.fingerprint, fingerprint))
            .cloned()
            .collect())
    }

    fn contains_path(&self, path: &str) -> Result<bool> {
        self.check()?;
        let files = self.files.read().unwrap_or_else(|p| p.into_inner());
        Ok(files.iter().any(|f| f.path == path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_matching() {
        let f = IndexedFile::new("i1", "/music/Artist - Song.flac", 10).with_recording("rec-1");
        assert_eq!(f.filename, "Artist - Song.flac");
        assert!(f.matches_text("song"));
        assert!(f.matches_text("artist song"));
        assert!(f.matches_text("rec-1"));
        assert!(!f.matches_text("other"));
        assert!(!f.matches_text("   "));
    }

    #[test]
    fn find_by_any_key_and_failure() {
        let index = MemoryLibraryIndex::with_files([
            IndexedFile::new("i1", "/a.flac", 1).with_recording("rec"),
            IndexedFile::new("i2", "/b.mp3", 1).with_recording("rec"),
            IndexedFile::new("i3", "/c.mp3", 1),
        ]);
        assert_eq!(index.find("i3", None, None).unwrap().len(), 1);
        assert_eq!(index.find("zz", Some("rec"), None).unwrap().len(), 2);
        index.set_failing(true);
        assert!(index.search("a").is_err());
    }
}
