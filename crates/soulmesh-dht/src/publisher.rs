//! Self-descriptor publishing and peer resolution.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use soulmesh_identity::{Capability, PeerIdentity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::{descriptor_key, PeerDescriptor};
use crate::entry::now_ms;
use crate::rendezvous::Rendezvous;

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub refresh_interval: Duration,
    /// Bound on each put/get.
    pub op_timeout: Duration,
    /// How long a published descriptor lives in the DHT.
    pub descriptor_ttl: Duration,
    pub seeds: Vec<SocketAddr>,
    pub addresses: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30 * 60),
            op_timeout: Duration::from_secs(10),
            descriptor_ttl: Duration::from_secs(60 * 60),
            seeds: Vec::new(),
            addresses: Vec::new(),
            capabilities: vec![Capability::Mesh],
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

impl PublisherConfig {
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }
}

/// Exponential backoff: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the next call returns double.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Publishes this node's descriptor and resolves others.
pub struct DescriptorPublisher {
    identity: Arc<PeerIdentity>,
    rendezvous: Arc<dyn Rendezvous>,
    config: PublisherConfig,
}

impl DescriptorPublisher {
    pub fn new(
        identity: Arc<PeerIdentity>,
        rendezvous: Arc<dyn Rendezvous>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            identity,
            rendezvous,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Sign and store the local descriptor. Failures are logged, not returned.
    pub async fn publish_self_descriptor(&self) -> bool {
        let descriptor = match PeerDescriptor::signed(
            &self.identity,
            self.config.addresses.clone(),
            self.config.capabilities.clone(),
            now_ms(),
        ) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to build descriptor: {}", e);
                return false;
            }
        };
        let bytes = match descriptor.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to encode descriptor: {}", e);
                return false;
            }
        };

        let key = descriptor_key(self.identity.peer_id());
        let put = self.rendezvous.put(key, bytes.into(), self.config.descriptor_ttl);
        match tokio::time::timeout(self.config.op_timeout, put).await {
            Ok(Ok(replicas)) => {
                info!("Published descriptor to {} replica(s)", replicas);
                true
            }
            Ok(Err(e)) => {
                warn!("Descriptor publish failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Descriptor publish timed out after {:?}", self.config.op_timeout);
                false
            }
        }
    }

    /// Resolve a peer's descriptor. `None` means currently unreachable via rendezvous.
    pub async fn resolve(&self, peer_id: &str) -> Option<PeerDescriptor> {
        let get = self.rendezvous.get(descriptor_key(peer_id));
        let value = match tokio::time::timeout(self.config.op_timeout, get).await {
            Ok(Ok(Some(value))) => value,
            Ok(Ok(None)) => {
                debug!(peer = %peer_id, "no descriptor found");
                return None;
            }
            Ok(Err(e)) => {
                debug!(peer = %peer_id, "descriptor lookup failed: {}", e);
                return None;
            }
            Err(_) => {
                debug!(peer = %peer_id, "descriptor lookup timed out");
                return None;
            }
        };

        let descriptor = match PeerDescriptor::from_bytes(value.as_bytes()) {
            Ok(d) => d,
            Err(e) => {
                warn!(peer = %peer_id, "undecodable descriptor: {}", e);
                return None;
            }
        };
        if descriptor.peer_id != peer_id || !descriptor.verify() {
            warn!(peer = %peer_id, "descriptor failed verification");
            return None;
        }
        Some(descriptor)
    }

    /// Join the DHT through the configured seeds, retrying with backoff.
    ///
    /// Returns false only if cancelled first.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> bool {
        if self.config.seeds.is_empty() {
            return true;
        }
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        loop {
            let attempt = self.rendezvous.bootstrap(&self.config.seeds);
            let reached = match tokio::time::timeout(self.config.op_timeout, attempt).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("bootstrap attempt failed: {}", e);
                    0
                }
                Err(_) => 0,
            };
            if reached > 0 {
                info!("Joined DHT through {}/{} seed(s)", reached, self.config.seeds.len());
                return true;
            }

            let delay = backoff.next_delay();
            warn!(
                "All {} DHT seed(s) unreachable, running degraded; retrying in {:?}",
                self.config.seeds.len(),
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Bootstrap, publish, then refresh until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.bootstrap(&cancel).await {
            return;
        }
        self.publish_self_descriptor().await;

        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.publish_self_descriptor().await {
                        // Seeds may have gone away; rejoin before the next refresh.
                        if !self.bootstrap(&cancel).await {
                            break;
                        }
                        self.publish_self_descriptor().await;
                    }
                }
            }
        }
        debug!("Descriptor publisher stopped");
    }
}
