//! Search actions routed into this node.
//!
//! Mesh results become single-item jobs, so the job runner resolves them
//! through the planner like any other acquisition. The legacy network is
//! reached through an external bridge; without one, legacy routes are refused.

use std::sync::Arc;

use async_trait::async_trait;
use soulmesh_search::{ActionTarget, Route, RoutingError, SearchAction, LEGACY_PROVIDER, MESH_PROVIDER};
use tracing::debug;

use crate::error::Error;
use crate::jobs::{CreateJobRequest, JobItemRequest, JobQueue};
use crate::storage::Storage;

pub struct NodeActionTarget {
    storage: Arc<Storage>,
    jobs: JobQueue,
    domain: String,
}

impl NodeActionTarget {
    pub fn new(storage: Arc<Storage>, jobs: JobQueue, domain: impl Into<String>) -> Self {
        Self {
            storage,
            jobs,
            domain: domain.into(),
        }
    }
}

fn rejected(target: &str, reason: impl Into<String>) -> RoutingError {
    RoutingError::Rejected {
        target: target.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl ActionTarget for NodeActionTarget {
    async fn mesh_fetch(&self, route: &Route, action: SearchAction) -> Result<String, RoutingError> {
        let request = route
            .transfer_request(&self.domain)
            .ok_or_else(|| rejected(MESH_PROVIDER, "not a mesh route"))?;
        let job = CreateJobRequest {
            items: vec![JobItemRequest {
                item_id: request.item_id,
                domain: request.domain,
                filename: request.filename,
                size: request.file_size,
                recording_id: None,
                fingerprint: None,
            }],
        };
        match self.jobs.submit(&self.storage, job, soulmesh_dht::now_ms()).await {
            Ok(job) => {
                debug!(job = %job.id, ?action, "Mesh result queued as job");
                Ok(job.id.to_string())
            }
            Err(Error::InvalidInput(reason)) => Err(rejected(MESH_PROVIDER, reason)),
            Err(e) => Err(rejected(MESH_PROVIDER, format!("job not stored: {e}"))),
        }
    }

    async fn legacy_enqueue(&self, _route: &Route, _action: SearchAction) -> Result<String, RoutingError> {
        Err(rejected(LEGACY_PROVIDER, "no legacy bridge is attached to this node"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn target(domain: &str) -> (tempfile::TempDir, NodeActionTarget, tokio::sync::mpsc::Receiver<Uuid>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path().join("db")).unwrap());
        let (jobs, rx) = JobQueue::channel(4);
        (dir, NodeActionTarget::new(storage, jobs, domain), rx)
    }

    fn mesh_route() -> Route {
        Route::MeshFetch {
            peer_id: "b3b3/peer".into(),
            content_id: "item-9".into(),
            filename: "Song.flac".into(),
            size: 640,
        }
    }

    #[tokio::test]
    async fn mesh_fetch_becomes_a_queued_job() {
        let (_dir, target, mut rx) = target("music");
        let handle = target.mesh_fetch(&mesh_route(), SearchAction::Download).await.unwrap();
        let id: Uuid = handle.parse().unwrap();
        assert_eq!(rx.recv().await, Some(id));

        let job = target.storage.get_job(&id).unwrap().unwrap();
        assert_eq!(job.items.len(), 1);
        assert_eq!(job.items[0].request.item_id, "item-9");
        assert_eq!(job.items[0].request.size, 640);
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected() {
        let (_dir, target, _rx) = target("podcast");
        let err = target.mesh_fetch(&mesh_route(), SearchAction::Stream).await.unwrap_err();
        assert!(matches!(err, RoutingError::Rejected { ref target, .. } if target == MESH_PROVIDER));
    }

    #[tokio::test]
    async fn legacy_routes_need_a_bridge() {
        let (_dir, target, _rx) = target("music");
        let route = Route::LegacyEnqueue {
            username: "alice".into(),
            filename: "Song.flac".into(),
            size: 640,
        };
        let err = target.legacy_enqueue(&route, SearchAction::Download).await.unwrap_err();
        assert!(err.to_string().contains("no legacy bridge"));
    }
}
