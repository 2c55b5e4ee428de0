//! Error types for soulmesh-identity.

use thiserror::Error;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or encoding identity material.
///
/// Handshake validation failures are not errors; see
/// [`HandshakeRejection`](crate::HandshakeRejection).
#[derive(Debug, Error)]
pub enum Error {
    /// Secret key material had the wrong length.
    #[error("invalid secret key length: expected 32 bytes, got {0}")]
    InvalidSecretKey(usize),

    /// Hex decoding failed.
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
