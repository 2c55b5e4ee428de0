//! Routing download and stream actions to the backend that owns a result.
//!
//! The `primary_source` tag alone is not trusted: a result only routes when
//! it carries the reference data its path needs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use soulmesh_transfer::TransferRequest;
use tracing::{info, warn};

use crate::aggregator::{AggregatedResult, LEGACY_PROVIDER, MESH_PROVIDER};
use crate::error::RoutingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchAction {
    Download,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    /// Fetch by content id from a mesh peer.
    MeshFetch {
        peer_id: String,
        content_id: String,
        filename: String,
        size: u64,
    },
    /// Enqueue on the legacy network.
    LegacyEnqueue {
        username: String,
        filename: String,
        size: u64,
    },
}

impl Route {
    /// Transfer request for the planner. Mesh routes only.
    pub fn transfer_request(&self, domain: &str) -> Option<TransferRequest> {
        match self {
            Route::MeshFetch {
                content_id,
                filename,
                size,
                ..
            } => Some(TransferRequest::new(content_id, domain, filename, *size)),
            Route::LegacyEnqueue { .. } => None,
        }
    }
}

/// Work the route resolved to, as reported by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTicket {
    pub route: Route,
    pub action: SearchAction,
    /// Target-specific handle (transfer or queue id).
    pub handle: String,
}

/// Receives routed actions. The node wires mesh fetches to the transfer
/// resolver and legacy enqueues to the external bridge.
#[async_trait]
pub trait ActionTarget: Send + Sync {
    async fn mesh_fetch(&self, route: &Route, action: SearchAction) -> Result<String, RoutingError>;

    async fn legacy_enqueue(&self, route: &Route, action: SearchAction) -> Result<String, RoutingError>;
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Decide where `result` goes, or why it cannot go anywhere.
pub fn route(result: &AggregatedResult) -> Result<Route, RoutingError> {
    if result.filename.trim().is_empty() {
        return Err(RoutingError::MissingFilename {
            filename: result.filename.clone(),
        });
    }
    match result.primary_source.as_str() {
        MESH_PROVIDER => {
            let peer_id = present(&result.peer_id).ok_or_else(|| RoutingError::MissingMeshPeer {
                filename: result.filename.clone(),
            })?;
            let content_id = present(&result.content_id).ok_or_else(|| RoutingError::MissingContentId {
                filename: result.filename.clone(),
            })?;
            Ok(Route::MeshFetch {
                peer_id: peer_id.to_string(),
                content_id: content_id.to_string(),
                filename: result.filename.clone(),
                size: result.size,
            })
        }
        LEGACY_PROVIDER => {
            let username = present(&result.username).ok_or_else(|| RoutingError::MissingLegacyUser {
                filename: result.filename.clone(),
            })?;
            Ok(Route::LegacyEnqueue {
                username: username.to_string(),
                filename: result.filename.clone(),
                size: result.size,
            })
        }
        other => Err(RoutingError::UnknownSource(other.to_string())),
    }
}

pub struct ActionRouter {
    target: Arc<dyn ActionTarget>,
}

impl ActionRouter {
    pub fn new(target: Arc<dyn ActionTarget>) -> Self {
        Self { target }
    }

    pub async fn dispatch(&self, result: &AggregatedResult, action: SearchAction) -> Result<ActionTicket, RoutingError> {
        let route = route(result).inspect_err(|e| {
            warn!(filename = %result.filename, primary = %result.primary_source, error = %e, "Action not routable");
        })?;
        let handle = match &route {
            Route::MeshFetch { .. } => self.target.mesh_fetch(&route, action).await?,
            Route::LegacyEnqueue { .. } => self.target.legacy_enqueue(&route, action).await?,
        };
        info!(filename = %result.filename, ?action, %handle, "Action dispatched");
        Ok(ActionTicket { route, action, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    fn result(primary: &str) -> AggregatedResult {
        AggregatedResult {
            filename: "song.flac".into(),
            size: 100,
            source_providers: BTreeSet::from([primary.to_string()]),
            primary_source: primary.into(),
            username: None,
            peer_id: None,
            content_id: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionTarget for Recorder {
        async fn mesh_fetch(&self, route: &Route, _action: SearchAction) -> Result<String, RoutingError> {
            self.calls.lock().unwrap().push(format!("mesh:{route:?}"));
            Ok("t-1".into())
        }

        async fn legacy_enqueue(&self, _route: &Route, _action: SearchAction) -> Result<String, RoutingError> {
            self.calls.lock().unwrap().push("legacy".into());
            Err(RoutingError::Rejected {
                target: "legacy".into(),
                reason: "queue full".into(),
            })
        }
    }

    #[test]
    fn mesh_route_needs_peer_and_content() {
        let mut r = result(MESH_PROVIDER);
        assert!(matches!(route(&r), Err(RoutingError::MissingMeshPeer { .. })));
        r.peer_id = Some("peer-b".into());
        assert!(matches!(route(&r), Err(RoutingError::MissingContentId { .. })));
        r.content_id = Some("item-1".into());
        let routed = route(&r).unwrap();
        let request = routed.transfer_request("music").unwrap();
        assert_eq!(request.item_id, "item-1");
        assert_eq!(request.file_size, 100);
    }

    #[test]
    fn legacy_route_needs_username() {
        let mut r = result(LEGACY_PROVIDER);
        r.peer_id = Some("peer-b".into());
        assert!(matches!(route(&r), Err(RoutingError::MissingLegacyUser { .. })));
        r.username = Some(" ".into());
        assert!(matches!(route(&r), Err(RoutingError::MissingLegacyUser { .. })));
        r.username = Some("alice".into());
        assert!(route(&r).unwrap().transfer_request("music").is_none());
    }

    #[test]
    fn unknown_source_is_named() {
        assert_eq!(route(&result("gopher")), Err(RoutingError::UnknownSource("gopher".into())));
    }

    #[tokio::test]
    async fn dispatch_reaches_the_right_target() {
        let recorder = Arc::new(Recorder::default());
        let router = ActionRouter::new(Arc::clone(&recorder) as Arc<dyn ActionTarget>);

        let mut mesh = result(MESH_PROVIDER);
        mesh.peer_id = Some("peer-b".into());
        mesh.content_id = Some("item-1".into());
        let ticket = router.dispatch(&mesh, SearchAction::Stream).await.unwrap();
        assert_eq!(ticket.handle, "t-1");

        let mut legacy = result(LEGACY_PROVIDER);
        legacy.username = Some("alice".into());
        assert!(matches!(
            router.dispatch(&legacy, SearchAction::Download).await,
            Err(RoutingError::Rejected { .. })
        ));

        assert!(router.dispatch(&result(MESH_PROVIDER), SearchAction::Download).await.is_err());
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }
}
