//! Search providers and the federated fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use soulmesh_discovery::{SearchRequest, SearchTransport, MAX_RESULTS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregator::{AggregatedResult, AggregatorConfig, ProviderHit, SearchAggregator, MESH_PROVIDER};
use crate::error::{Error, Result};

/// A named source of search hits.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<ProviderHit>>;
}

/// Searches every reachable mesh neighbor.
pub struct MeshSearchProvider {
    transport: Arc<dyn SearchTransport>,
    max_results: i64,
}

impl MeshSearchProvider {
    pub fn new(transport: Arc<dyn SearchTransport>) -> Self {
        Self {
            transport,
            max_results: MAX_RESULTS,
        }
    }

    pub fn with_max_results(mut self, n: i64) -> Self {
        self.max_results = n;
        self
    }
}

#[async_trait]
impl SearchProvider for MeshSearchProvider {
    fn name(&self) -> &str {
        MESH_PROVIDER
    }

    async fn search(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<ProviderHit>> {
        let request = SearchRequest::new(text, self.max_results);
        request
            .validate()
            .map_err(soulmesh_discovery::Error::from)?;

        let peers = self.transport.peers();
        let queries = peers.iter().map(|peer| {
            let request = request.clone();
            async move { (peer, self.transport.search(peer, request).await) }
        });
        let responses = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Vec::new()),
            r = join_all(queries) => r,
        };

        let mut hits = Vec::new();
        for (peer, response) in responses {
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    debug!(%peer, error = %e, "Mesh search failed");
                    continue;
                }
            };
            if let Err(e) = response.validate() {
                warn!(%peer, error = %e, "Discarding invalid search response");
                continue;
            }
            hits.extend(response.files.into_iter().map(|f| {
                let mut hit = ProviderHit::new(f.filename, f.size.max(0) as u64);
                hit.peer_id = Some(peer.clone());
                hit.content_id = f.item_id;
                hit
            }));
        }
        Ok(hits)
    }
}

/// Query every provider concurrently and merge what comes back. A failing
/// or slow provider only loses its own results.
pub async fn federated_search(
    providers: &[Arc<dyn SearchProvider>],
    text: &str,
    config: AggregatorConfig,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<AggregatedResult> {
    let searches = providers.iter().map(|p| async move {
        let outcome = match tokio::time::timeout(timeout, p.search(text, cancel)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Provider {
                provider: p.name().to_string(),
                reason: format!("no answer within {timeout:?}"),
            }),
        };
        (p.name().to_string(), outcome)
    });

    let mut aggregator = SearchAggregator::new(config);
    for (name, outcome) in join_all(searches).await {
        match outcome {
            Ok(hits) => aggregator.add(&name, hits),
            Err(e) => warn!(provider = %name, error = %e, "Search provider failed"),
        }
    }
    aggregator.into_results()
}
