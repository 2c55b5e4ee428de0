//! Soulmesh Search
//!
//! Federated search across the mesh and the legacy network, and routing of
//! the user's download/stream actions to the backend that can serve them.
//!
//! # Design
//!
//! - Results merge on normalized `(filename, size)`; provider identity is
//!   not part of the key. A merged result lists every provider that
//!   returned it and prefers the configured provider (mesh by default) as
//!   its primary source.
//! - A failing provider costs only its own results.
//! - Routing checks for the reference data each path needs and fails with
//!   a [`RoutingError`] naming what is missing.

mod aggregator;
mod error;
mod provider;
mod router;

pub use aggregator::{
    normalize_filename, AggregatedResult, AggregatorConfig, ProviderHit, SearchAggregator,
    LEGACY_PROVIDER, MESH_PROVIDER,
};
pub use error::{Error, Result, RoutingError};
pub use provider::{federated_search, MeshSearchProvider, SearchProvider};
pub use router::{route, ActionRouter, ActionTarget, ActionTicket, Route, SearchAction};
