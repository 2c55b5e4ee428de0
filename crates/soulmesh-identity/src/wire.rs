//! Handshake wire message.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::handshake::{
    build_handshake_payload, verify, Capability, FreshnessWindow, HandshakeRejection,
    PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use crate::keypair::{compute_peer_id_from_bytes, PeerIdentity};

/// Handshake as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    pub mesh_peer_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub username: String,
    /// Base64 of the 32-byte Ed25519 public key.
    pub public_key: String,
    /// Base64 of the 64-byte signature.
    pub signature: String,
    #[serde(default)]
    pub capability: Capability,
}

impl HandshakeMessage {
    /// Build and sign a handshake for the local identity.
    pub fn create(
        identity: &PeerIdentity,
        username: impl Into<String>,
        capability: Capability,
        timestamp: i64,
    ) -> Self {
        let payload = build_handshake_payload(identity.peer_id(), capability, timestamp);
        let signature = identity.sign(&payload);
        Self {
            mesh_peer_id: identity.peer_id().to_string(),
            timestamp,
            username: username.into(),
            public_key: BASE64.encode(identity.public_key_bytes()),
            signature: BASE64.encode(signature),
            capability,
        }
    }
}

/// A peer whose handshake validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub peer_id: String,
    pub username: String,
    pub capability: Capability,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// Validates incoming handshake messages.
#[derive(Debug, Clone, Default)]
pub struct HandshakeVerifier {
    window: FreshnessWindow,
    require_peer_id_binding: bool,
}

impl HandshakeVerifier {
    pub fn new(window: FreshnessWindow) -> Self {
        Self {
            window,
            require_peer_id_binding: false,
        }
    }

    /// Require `meshPeerId` to equal the id derived from the public key.
    pub fn with_peer_id_binding(mut self, required: bool) -> Self {
        self.require_peer_id_binding = required;
        self
    }

    pub fn window(&self) -> FreshnessWindow {
        self.window
    }

    /// Validate a handshake against the local clock `now` (unix seconds).
    pub fn validate(
        &self,
        msg: &HandshakeMessage,
        now: i64,
    ) -> Result<VerifiedPeer, HandshakeRejection> {
        if msg.mesh_peer_id.trim().is_empty() {
            return Err(HandshakeRejection::EmptyPeerId);
        }

        self.window.check(msg.timestamp, now)?;

        let public_key: [u8; PUBLIC_KEY_LEN] = BASE64
            .decode(msg.public_key.as_bytes())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(HandshakeRejection::MalformedKey)?;
        let signature = BASE64
            .decode(msg.signature.as_bytes())
            .map_err(|_| HandshakeRejection::MalformedSignature)?;
        if signature.len() != SIGNATURE_LEN {
            return Err(HandshakeRejection::MalformedSignature);
        }

        let payload = build_handshake_payload(&msg.mesh_peer_id, msg.capability, msg.timestamp);
        if !verify(&payload, &signature, &public_key) {
            debug!(peer = %msg.mesh_peer_id, "handshake signature rejected");
            return Err(HandshakeRejection::BadSignature);
        }

        if self.require_peer_id_binding && compute_peer_id_from_bytes(&public_key) != msg.mesh_peer_id
        {
            return Err(HandshakeRejection::PeerIdMismatch);
        }

        Ok(VerifiedPeer {
            peer_id: msg.mesh_peer_id.clone(),
            username: msg.username.clone(),
            capability: msg.capability,
            public_key,
        })
    }
}
