//! Error types for soulmesh-discovery.

use thiserror::Error;

use crate::search::SearchValidationError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown content domain: {0}")]
    UnknownDomain(String),

    #[error("invalid search message: {0}")]
    InvalidSearch(#[from] SearchValidationError),

    /// The local library index could not answer.
    #[error("library index error: {0}")]
    Index(String),

    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("overlay error: {0}")]
    Overlay(#[from] soulmesh_overlay::Error),
}
