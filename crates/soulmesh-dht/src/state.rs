//! Local DHT storage.

use std::collections::HashMap;

use crate::{DhtEntry, DhtKey};

/// Records held per node unless configured otherwise.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Entries this node holds, either its own or replicated from neighbors.
#[derive(Debug)]
pub struct DhtState {
    entries: HashMap<DhtKey, DhtEntry>,
    max_entries: usize,
}

impl Default for DhtState {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }
}

impl DhtState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State that holds at most `max_entries` keys.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Live entry for `key`; expired entries read as absent.
    pub fn get(&self, key: &DhtKey, now_ms: u64) -> Option<&DhtEntry> {
        self.entries.get(key).filter(|e| !e.is_expired(now_ms))
    }

    /// Store with last-write-wins. Returns true if stored.
    pub fn put_entry(&mut self, entry: DhtEntry) -> bool {
        let key = entry.key;
        match self.entries.get_mut(&key) {
            Some(existing) if existing.expires_at <= entry.timestamp => {
                *existing = entry;
                true
            }
            Some(existing) => existing.merge(entry),
            None => self.insert_new(entry),
        }
    }

    /// Store regardless of timestamps. Used for this node's own writes.
    pub fn replace(&mut self, entry: DhtEntry) -> bool {
        match self.entries.get_mut(&entry.key) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => self.insert_new(entry),
        }
    }

    /// A new key needs a free slot; an expired entry is given up for it.
    fn insert_new(&mut self, entry: DhtEntry) -> bool {
        if self.entries.len() >= self.max_entries {
            let stale = self
                .entries
                .values()
                .find(|e| e.is_expired(entry.timestamp))
                .map(|e| e.key);
            match stale {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => return false,
            }
        }
        self.entries.insert(entry.key, entry);
        true
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune_expired(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now_ms));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
