//! DHT entry types.

use serde::{Deserialize, Serialize};

/// A 32-byte DHT key (Blake3 hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DhtKey(pub [u8; 32]);

impl DhtKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Self(arr))
    }

    /// XOR distance to another key.
    pub fn distance(&self, other: &DhtKey) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl std::fmt::Display for DhtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 hex chars
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// DHT value - arbitrary bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtValue(pub Vec<u8>);

impl DhtValue {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<Vec<u8>> for DhtValue {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&str> for DhtValue {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// A stored value with its write time and expiry.
///
/// Timestamps are unix milliseconds. Conflicts resolve last-write-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtEntry {
    pub key: DhtKey,
    pub value: DhtValue,
    pub timestamp: u64,
    pub expires_at: u64,
}

impl DhtEntry {
    pub fn new(key: DhtKey, value: DhtValue, timestamp: u64, ttl_ms: u64) -> Self {
        Self {
            key,
            value,
            timestamp,
            expires_at: timestamp.saturating_add(ttl_ms),
        }
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.timestamp > other.timestamp
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Keep the newer of the two. Returns true if self was replaced.
    pub fn merge(&mut self, other: Self) -> bool {
        if other.is_newer_than(self) {
            *self = other;
            true
        } else {
            false
        }
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
