//! Error types for soulmesh-transfer.

use thiserror::Error;

/// Why one chunk fetch did not produce data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("chunk fetch timed out")]
    Timeout,

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("chunk fetch failed: {0}")]
    Failed(String),

    #[error("chunk fetch cancelled")]
    Cancelled,
}
