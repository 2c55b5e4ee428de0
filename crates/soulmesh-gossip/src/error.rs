//! Error types for soulmesh-gossip.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message type and originator must be non-empty")]
    Malformed,

    #[error("node is not a member of realm {0}")]
    NotInRealm(String),

    #[error("frame error: {0}")]
    Overlay(#[from] soulmesh_overlay::Error),
}
