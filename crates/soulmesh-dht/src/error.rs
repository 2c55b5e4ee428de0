//! Error types for soulmesh-dht.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dht operation timed out")]
    Timeout,

    #[error("no rendezvous peers reachable")]
    Unreachable,

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("frame body error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("overlay error: {0}")]
    Overlay(#[from] soulmesh_overlay::Error),
}
