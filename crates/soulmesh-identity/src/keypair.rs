//! Node keypair and peer-id derivation.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Compute a peer id from an Ed25519 public key using double-BLAKE3.
///
/// `hash1 = BLAKE3(pubkey)`, `hash2 = BLAKE3(hash1)`, id = `"b3b3/{hex(hash2)}"`.
pub fn compute_peer_id(pubkey: &VerifyingKey) -> String {
    compute_peer_id_from_bytes(pubkey.as_bytes())
}

/// Compute a peer id from raw public key bytes.
pub fn compute_peer_id_from_bytes(pubkey_bytes: &[u8]) -> String {
    let hash1 = blake3::hash(pubkey_bytes);
    let hash2 = blake3::hash(hash1.as_bytes());
    format!("b3b3/{}", hex::encode(hash2.as_bytes()))
}

/// Check that a claimed peer id matches the given public key.
pub fn verify_peer_id(claimed_id: &str, pubkey: &VerifyingKey) -> bool {
    compute_peer_id(pubkey) == claimed_id
}

/// The local node's identity.
///
/// Owns the signing key exclusively. Only the public key and peer id are ever
/// handed to other components or peers; the secret leaves this type only via
/// [`PeerIdentity::secret_bytes`] for local persistence.
pub struct PeerIdentity {
    signing_key: SigningKey,
    peer_id: String,
}

impl PeerIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Build an identity from an existing signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = compute_peer_id(&signing_key.verifying_key());
        Self {
            signing_key,
            peer_id,
        }
    }

    /// Restore an identity from persisted secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSecretKey(bytes.len()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    /// Restore an identity from a hex-encoded secret.
    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        Self::from_secret_bytes(&bytes)
    }

    /// Secret key bytes, for local persistence only.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
