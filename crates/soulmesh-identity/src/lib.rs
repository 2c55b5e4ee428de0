//! Soulmesh Identity
//!
//! Peer identity and handshake authentication for the Soulmesh overlay.
//!
//! # Design
//!
//! Every node owns a single Ed25519 signing key. The peer id is derived from
//! the public key with double-BLAKE3 (`b3b3/{hex}`), so any peer can check
//! that a claimed id belongs to the key that signed a handshake.
//!
//! A handshake binds `(peer id, declared capability, timestamp)`. The bytes
//! that get signed are the UTF-8 string `"{peer_id}|{capability}|{timestamp}"`,
//! which is stable across implementations.
//!
//! # Validation order
//!
//! ```text
//! freshness window -> key/signature decoding -> signature -> peer-id binding
//! ```
//!
//! Freshness runs first so replayed messages are rejected without spending a
//! signature check. A stale message rejects the message, not the connection:
//! the remote peer may retry with a fresh timestamp.

mod error;
mod handshake;
mod keypair;
mod wire;

pub use error::{Error, Result};
pub use handshake::{
    build_handshake_payload, sign, verify, Capability, FreshnessWindow, HandshakePayload,
    HandshakeRejection, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
pub use keypair::{compute_peer_id, compute_peer_id_from_bytes, verify_peer_id, PeerIdentity};
pub use wire::{HandshakeMessage, HandshakeVerifier, VerifiedPeer};

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
