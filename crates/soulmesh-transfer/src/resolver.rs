//! Plan, execute, and re-plan once when sources run out.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::plan::{PlanStatus, TransferPlan, TransferRequest};
use crate::planner::MultiSourcePlanner;
use crate::swarm::{ChunkManifest, SwarmDownloader, SwarmReport, SwarmStatus};

#[derive(Debug, Clone)]
pub struct ResolvedTransfer {
    pub plan: TransferPlan,
    pub data: Option<Bytes>,
    /// Report of the last swarm run, if one started.
    pub report: Option<SwarmReport>,
}

pub struct TransferResolver {
    planner: Arc<MultiSourcePlanner>,
    downloader: Arc<SwarmDownloader>,
    max_replans: u32,
}

impl TransferResolver {
    pub fn new(planner: Arc<MultiSourcePlanner>, downloader: Arc<SwarmDownloader>) -> Self {
        Self {
            planner,
            downloader,
            max_replans: 1,
        }
    }

    pub fn with_max_replans(mut self, n: u32) -> Self {
        self.max_replans = n;
        self
    }

    pub fn planner(&self) -> &Arc<MultiSourcePlanner> {
        &self.planner
    }

    pub async fn resolve(
        &self,
        request: &TransferRequest,
        manifest: Option<ChunkManifest>,
        cancel: &CancellationToken,
    ) -> ResolvedTransfer {
        let mut plan = self.planner.plan(request, cancel).await;
        let mut last_report = None;

        while plan.status == PlanStatus::Planned {
            let report = self.downloader.download(&plan, manifest.clone(), cancel).await;
            match &report.status {
                SwarmStatus::Completed => {
                    plan.mark_completed();
                }
                SwarmStatus::Cancelled => {
                    plan.mark_cancelled();
                }
                SwarmStatus::Failed(reason) => {
                    plan.mark_failed(format!("Transfer failed: {reason}"));
                }
                SwarmStatus::Exhausted if plan.replans < self.max_replans => {
                    warn!(item = %plan.desired_item_id, "Sources exhausted, re-planning");
                    self.planner.replan(&mut plan, request, cancel).await;
                }
                SwarmStatus::Exhausted => {
                    plan.mark_failed("All sources exhausted");
                }
            }
            last_report = Some(report);
        }

        info!(item = %plan.desired_item_id, status = ?plan.status, replans = plan.replans, "Transfer resolved");
        let data = match plan.status {
            PlanStatus::Completed => last_report.as_ref().and_then(|r| r.data.clone()),
            _ => None,
        };
        ResolvedTransfer {
            plan,
            data,
            report: last_report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainGate;
    use crate::error::FetchError;
    use crate::planner::PlannerConfig;
    use crate::rescue::ThroughputRescue;
    use crate::swarm::{ChunkFetcher, ChunkSpec, SwarmConfig};
    use async_trait::async_trait;
    use soulmesh_discovery::{
        Backend, BackendRef, ExternalBackend, ModerationOracle, SourceCandidate,
        StaticCandidateSource, StaticModeration,
    };
    use soulmesh_reputation::PeerMetricsService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then serves zeros.
    struct FlakyFetcher {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl ChunkFetcher for FlakyFetcher {
        async fn fetch_chunk(&self, _source: &SourceCandidate, chunk: &ChunkSpec) -> Result<Bytes, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(FetchError::Unavailable("refused".into()));
            }
            Ok(Bytes::from(vec![0u8; chunk.len as usize]))
        }
    }

    fn resolver(failures: usize, max_replans: u32) -> TransferResolver {
        let moderation = Arc::new(StaticModeration::new());
        moderation.allow("movie");
        let source = SourceCandidate::new("movie", BackendRef::Url { url: "https://m/movie".into() }, 0).with_size(100);
        let metrics = Arc::new(PeerMetricsService::default());
        let planner = MultiSourcePlanner::new(
            vec![Backend::Http(ExternalBackend::new(Arc::new(StaticCandidateSource::new(vec![source]))))],
            DomainGate::default(),
            moderation as Arc<dyn ModerationOracle>,
            Arc::clone(&metrics),
            PlannerConfig::default(),
        );
        let downloader = SwarmDownloader::new(
            Arc::new(FlakyFetcher { calls: AtomicUsize::new(0), failures }),
            metrics,
            Arc::new(ThroughputRescue::default()),
            SwarmConfig::default().with_chunk_size(10),
        );
        TransferResolver::new(Arc::new(planner), Arc::new(downloader)).with_max_replans(max_replans)
    }

    #[tokio::test]
    async fn replans_once_after_exhaustion() {
        let request = TransferRequest::new("movie", "video", "movie.mkv", 100);
        let resolved = resolver(2, 1).resolve(&request, None, &CancellationToken::new()).await;
        assert_eq!(resolved.plan.status, PlanStatus::Completed);
        assert_eq!(resolved.plan.replans, 1);
        assert_eq!(resolved.data.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn exhaustion_without_replans_fails() {
        let request = TransferRequest::new("movie", "video", "movie.mkv", 100);
        let resolved = resolver(2, 0).resolve(&request, None, &CancellationToken::new()).await;
        assert_eq!(resolved.plan.status, PlanStatus::Failed);
        assert_eq!(resolved.plan.error_message.as_deref(), Some("All sources exhausted"));
        assert!(resolved.data.is_none());
    }

    #[tokio::test]
    async fn invalid_domain_never_downloads() {
        let request = TransferRequest::new("movie", "hologram", "movie.mkv", 100);
        let resolved = resolver(0, 1).resolve(&request, None, &CancellationToken::new()).await;
        assert_eq!(resolved.plan.status, PlanStatus::Failed);
        assert!(resolved.report.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_is_marked() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = TransferRequest::new("movie", "video", "movie.mkv", 100);
        let resolved = resolver(0, 1).resolve(&request, None, &cancel).await;
        assert_eq!(resolved.plan.status, PlanStatus::Cancelled);
    }
}
