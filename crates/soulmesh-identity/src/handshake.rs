//! Handshake payload signing and verification.
//!
//! These are pure functions. `verify` never panics and never returns an
//! error: every malformed input is simply `false`.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Required Ed25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Required Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Capability a peer declares in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Full mesh participant (gossip, DHT, search, transfer).
    #[default]
    Mesh,
    /// Answers search requests only.
    Search,
    /// Serves chunks only.
    Transfer,
    /// Forwards traffic for other peers.
    Relay,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Mesh => "mesh",
            Capability::Search => "search",
            Capability::Transfer => "transfer",
            Capability::Relay => "relay",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mesh" => Ok(Capability::Mesh),
            "search" => Ok(Capability::Search),
            "transfer" => Ok(Capability::Transfer),
            "relay" => Ok(Capability::Relay),
            other => Err(format!("unknown capability: {}", other)),
        }
    }
}

/// The fields bound together by a handshake signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub peer_id: String,
    pub capability: Capability,
    pub timestamp: i64,
}

impl HandshakePayload {
    pub fn new(peer_id: impl Into<String>, capability: Capability, timestamp: i64) -> Self {
        Self {
            peer_id: peer_id.into(),
            capability,
            timestamp,
        }
    }

    /// Deterministic signing bytes: `"{peer_id}|{capability}|{timestamp}"`.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_handshake_payload(&self.peer_id, self.capability, self.timestamp)
    }
}

/// Encode the signed handshake string as UTF-8 bytes.
pub fn build_handshake_payload(peer_id: &str, capability: Capability, timestamp: i64) -> Vec<u8> {
    format!("{}|{}|{}", peer_id, capability.as_str(), timestamp).into_bytes()
}

/// Sign payload bytes with a private key.
pub fn sign(payload: &[u8], key: &SigningKey) -> [u8; SIGNATURE_LEN] {
    key.sign(payload).to_bytes()
}

/// Verify a signature over payload bytes. Fails closed.
pub fn verify(payload: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    key.verify(payload, &sig).is_ok()
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeRejection {
    #[error("handshake timestamp is {age_secs}s old")]
    Stale { age_secs: i64 },

    #[error("handshake timestamp is {ahead_secs}s in the future")]
    FromFuture { ahead_secs: i64 },

    #[error("mesh peer id is empty")]
    EmptyPeerId,

    #[error("public key is malformed")]
    MalformedKey,

    #[error("signature is malformed")]
    MalformedSignature,

    #[error("signature does not verify")]
    BadSignature,

    #[error("peer id does not match public key")]
    PeerIdMismatch,
}

/// Accepted clock skew for handshake timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessWindow {
    /// Maximum age in seconds.
    pub max_age_secs: i64,
    /// Maximum distance into the future in seconds.
    pub future_tolerance_secs: i64,
}

impl Default for FreshnessWindow {
    fn default() -> Self {
        Self {
            max_age_secs: 300,
            future_tolerance_secs: 30,
        }
    }
}

impl FreshnessWindow {
    pub fn with_max_age(mut self, secs: i64) -> Self {
        self.max_age_secs = secs;
        self
    }

    pub fn with_future_tolerance(mut self, secs: i64) -> Self {
        self.future_tolerance_secs = secs;
        self
    }

    /// Check a timestamp against the local clock.
    pub fn check(&self, timestamp: i64, now: i64) -> Result<(), HandshakeRejection> {
        let age = now.saturating_sub(timestamp);
        if age > self.max_age_secs {
            return Err(HandshakeRejection::Stale { age_secs: age });
        }
        if age < -self.future_tolerance_secs {
            return Err(HandshakeRejection::FromFuture {
                ahead_secs: age.saturating_neg(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerIdentity;
    use proptest::prelude::*;

    fn signed_payload() -> (Vec<u8>, [u8; 64], [u8; 32], SigningKey) {
        let identity = PeerIdentity::generate();
        let key = SigningKey::from_bytes(&identity.secret_bytes());
        let payload = HandshakePayload::new(identity.peer_id(), Capability::Mesh, 1_700_000_000);
        let bytes = payload.to_bytes();
        let sig = sign(&bytes, &key);
        (bytes, sig, identity.public_key_bytes(), key)
    }

    #[test]
    fn payload_is_pipe_delimited() {
        let bytes = build_handshake_payload("peer-a", Capability::Search, 42);
        assert_eq!(bytes, b"peer-a|search|42".to_vec());
    }

    #[test]
    fn payload_is_deterministic() {
        let a = HandshakePayload::new("p", Capability::Mesh, 7).to_bytes();
        let b = HandshakePayload::new("p", Capability::Mesh, 7).to_bytes();
        assert_eq!(a, b);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (bytes, sig, pk, _) = signed_payload();
        assert!(verify(&bytes, &sig, &pk));
    }

    #[test]
    fn tampered_signature_fails() {
        let (bytes, sig, pk, _) = signed_payload();
        for i in 0..sig.len() {
            let mut bad = sig;
            bad[i] ^= 0x01;
            assert!(!verify(&bytes, &bad, &pk), "byte {} flip accepted", i);
        }
    }

    #[test]
    fn tampered_payload_fails() {
        let (bytes, sig, pk, _) = signed_payload();
        for i in 0..bytes.len() {
            let mut bad = bytes.clone();
            bad[i] ^= 0x01;
            assert!(!verify(&bad, &sig, &pk));
        }
    }

    #[test]
    fn wrong_key_fails() {
        let (bytes, sig, _, _) = signed_payload();
        let other = PeerIdentity::generate();
        assert!(!verify(&bytes, &sig, &other.public_key_bytes()));
    }

    #[test]
    fn invalid_lengths_fail() {
        let (bytes, sig, pk, _) = signed_payload();
        assert!(!verify(&bytes, &sig, &pk[..31]));
        assert!(!verify(&bytes, &sig, &[pk.as_slice(), &[0]].concat()));
        assert!(!verify(&bytes, &sig[..63], &pk));
        assert!(!verify(&bytes, &[sig.as_slice(), &[0]].concat(), &pk));
        assert!(!verify(&bytes, &[], &[]));
    }

    #[test]
    fn capability_parse() {
        assert_eq!("MESH".parse::<Capability>().unwrap(), Capability::Mesh);
        assert_eq!("relay".parse::<Capability>().unwrap(), Capability::Relay);
        assert!("bogus".parse::<Capability>().is_err());
    }

    #[test]
    fn freshness_window_bounds() {
        let window = FreshnessWindow::default();
        let now = 10_000;
        assert!(window.check(now, now).is_ok());
        assert!(window.check(now - 300, now).is_ok());
        assert!(window.check(now + 30, now).is_ok());
        assert_eq!(
            window.check(now - 301, now),
            Err(HandshakeRejection::Stale { age_secs: 301 })
        );
        assert_eq!(
            window.check(now + 31, now),
            Err(HandshakeRejection::FromFuture { ahead_secs: 31 })
        );
    }

    #[test]
    fn freshness_window_builder() {
        let window = FreshnessWindow::default().with_max_age(10).with_future_tolerance(0);
        assert!(window.check(95, 100).is_ok());
        assert!(window.check(89, 100).is_err());
        assert!(window.check(101, 100).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_any_payload(peer in "[a-z0-9/]{1,40}", ts in any::<i64>(), secret in any::<[u8; 32]>()) {
            let key = SigningKey::from_bytes(&secret);
            let bytes = build_handshake_payload(&peer, Capability::Mesh, ts);
            let sig = sign(&bytes, &key);
            prop_assert!(verify(&bytes, &sig, key.verifying_key().as_bytes()));
        }

        #[test]
        fn garbage_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..64),
                                sig in proptest::collection::vec(any::<u8>(), 0..80),
                                pk in proptest::collection::vec(any::<u8>(), 0..40)) {
            let _ = verify(&payload, &sig, &pk);
        }
    }
}
