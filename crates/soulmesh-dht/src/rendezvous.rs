//! The pluggable rendezvous interface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::entry::now_ms;
use crate::error::{Error, Result};
use crate::{DhtEntry, DhtKey, DhtState, DhtValue};

/// Minimal DHT contract: `put`, `get`, and joining through seeds.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Store a value. Returns how many replicas accepted it (including local).
    async fn put(&self, key: DhtKey, value: DhtValue, ttl: Duration) -> Result<usize>;

    /// Look a value up. `Ok(None)` means not found, not failure.
    async fn get(&self, key: DhtKey) -> Result<Option<DhtValue>>;

    /// Join through seed nodes. Returns how many answered.
    async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize>;
}

/// In-process rendezvous shared by clones. Used for single-host setups and tests.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    state: Arc<Mutex<DhtState>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing every seed.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::Release);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::Acquire) {
            Err(Error::Unreachable)
        } else {
            Ok(())
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DhtState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn put(&self, key: DhtKey, value: DhtValue, ttl: Duration) -> Result<usize> {
        self.check_reachable()?;
        let entry = DhtEntry::new(key, value, now_ms(), ttl.as_millis() as u64);
        self.with_state(|s| s.put_entry(entry));
        Ok(1)
    }

    async fn get(&self, key: DhtKey) -> Result<Option<DhtValue>> {
        self.check_reachable()?;
        let now = now_ms();
        Ok(self.with_state(|s| s.get(&key, now).map(|e| e.value.clone())))
    }

    async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        if self.unreachable.load(Ordering::Acquire) {
            return Ok(0);
        }
        Ok(seeds.len().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_key;

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryRendezvous::new();
        let b = a.clone();
        a.put(hash_key(b"k"), "v".into(), Duration::from_secs(60)).await.unwrap();
        let got = b.get(hash_key(b"k")).await.unwrap();
        assert_eq!(got.unwrap().as_str(), Some("v"));
        assert!(b.get(hash_key(b"missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_fails_softly() {
        let dht = MemoryRendezvous::new();
        dht.set_reachable(false);
        assert!(matches!(
            dht.put(hash_key(b"k"), "v".into(), Duration::from_secs(1)).await,
            Err(Error::Unreachable)
        ));
        assert_eq!(dht.bootstrap(&[]).await.unwrap(), 0);

        dht.set_reachable(true);
        assert_eq!(dht.bootstrap(&[]).await.unwrap(), 1);
    }
}
