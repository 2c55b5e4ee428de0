//! Bounded recent-id set.

use std::num::NonZeroUsize;

use lru::LruCache;
use uuid::Uuid;

/// Remembers message ids for a time window, capped in count.
pub struct RecentIds {
    cache: LruCache<Uuid, u64>,
    window_ms: u64,
}

impl RecentIds {
    pub fn new(capacity: usize, window_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            window_ms,
        }
    }

    /// Record `id`; returns false if it was already seen within the window.
    pub fn insert(&mut self, id: Uuid, now_ms: u64) -> bool {
        if let Some(seen_at) = self.cache.get(&id) {
            if now_ms.saturating_sub(*seen_at) < self.window_ms {
                return false;
            }
        }
        self.cache.put(id, now_ms);
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.cache.contains(id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
