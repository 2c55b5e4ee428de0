//! Error types for soulmesh-reputation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing metrics store failed.
    #[error("metrics store error: {0}")]
    Store(String),
}
