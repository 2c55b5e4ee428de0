//! Error types for soulmesh-search.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("provider {provider} failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("discovery error: {0}")]
    Discovery(#[from] soulmesh_discovery::Error),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Why an action could not be routed. Each variant names what is missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("result {filename:?} is sourced from the mesh but has no peer id; search the mesh again")]
    MissingMeshPeer { filename: String },

    #[error("result {filename:?} is sourced from the mesh but has no content id; search the mesh again")]
    MissingContentId { filename: String },

    #[error("result {filename:?} is sourced from the legacy network but has no username")]
    MissingLegacyUser { filename: String },

    #[error("result {filename:?} has an empty filename reference")]
    MissingFilename { filename: String },

    #[error("no route for primary source {0:?}")]
    UnknownSource(String),

    #[error("{target} rejected the action: {reason}")]
    Rejected { target: String, reason: String },
}
