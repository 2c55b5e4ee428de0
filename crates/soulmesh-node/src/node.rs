//! Soulmesh node: wires the mesh services together and runs them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use soulmesh_dht::{DescriptorPublisher, OverlayRendezvous, RecordPolicy, Rendezvous};
use soulmesh_discovery::{
    Backend, ContentDiscovery, DiscoveryConfig, ExtensionQualityScorer, LibraryIndex, LocalLibraryBackend,
    LocalSearchHandler, MemoryLibraryIndex, MeshBackend, ModerationOracle, ModerationVerdict,
    OverlaySearchTransport, QualityScorer, SearchTransport, StaticModeration,
};
use soulmesh_gossip::{GossipMessage, GossipService, Subscription};
use soulmesh_identity::{HandshakeVerifier, PeerIdentity};
use soulmesh_overlay::{NeighborRegistry, Overlay};
use soulmesh_reputation::PeerMetricsService;
use soulmesh_search::{MeshSearchProvider, SearchProvider};
use soulmesh_transfer::{AudioVariant, DomainGate, MultiSourcePlanner, SwarmDownloader, TransferResolver};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{self, ApiState, VARIANT_SEEN};
use crate::config::NodeConfig;
use crate::disaster::DisasterMode;
use crate::error::Result;
use crate::jobs::{JobQueue, JobRunner};
use crate::library::scan_dir;
use crate::mesh::{ChunkServer, NodeChunkFetcher, NodeFrameHandler};
use crate::storage::Storage;

const JOB_QUEUE_CAPACITY: usize = 64;
const NEIGHBOR_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Every item is advertisable. Private meshes only.
struct AllowAll;

impl ModerationOracle for AllowAll {
    fn verdict(&self, _item_id: &str) -> Option<ModerationVerdict> {
        Some(ModerationVerdict::Allowed)
    }
}

fn moderation_from(config: &NodeConfig) -> Arc<dyn ModerationOracle> {
    if config.moderation.allow_all {
        warn!("Moderation disabled: every item is advertisable");
        return Arc::new(AllowAll);
    }
    let moderation = StaticModeration::new();
    for item in &config.moderation.allowed_items {
        moderation.allow(item.clone());
    }
    Arc::new(moderation)
}

/// Rebuild a variant announced by a peer, re-running the local assessment
/// rather than trusting the sender's.
fn variant_from_gossip(message: &GossipMessage) -> Option<AudioVariant> {
    let announced: AudioVariant = serde_json::from_value(message.payload.clone()).ok()?;
    if announced.recording_id.is_empty() || announced.variant_id.is_empty() {
        return None;
    }
    let variant = AudioVariant::new(
        announced.variant_id,
        announced.recording_id,
        announced.codec,
        announced.sample_rate_hz,
        announced.bit_depth,
        announced.bitrate_kbps,
    );
    Some(match announced.channels {
        Some(c) => variant.with_channels(c),
        None => variant,
    })
}

/// A running mesh node.
pub struct SoulmeshNode {
    config: NodeConfig,
    storage: Arc<Storage>,
    identity: Arc<PeerIdentity>,
    overlay: Arc<Overlay>,
    rendezvous: Arc<OverlayRendezvous>,
    publisher: Arc<DescriptorPublisher>,
    gossip: GossipService,
    metrics: Arc<PeerMetricsService>,
    library: Arc<MemoryLibraryIndex>,
    moderation: Arc<dyn ModerationOracle>,
    search_transport: Arc<OverlaySearchTransport>,
    resolver: Arc<TransferResolver>,
    disaster: Arc<DisasterMode>,
}

impl SoulmeshNode {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Arc::new(Storage::open(config.data_dir.join("db"))?);
        let identity = Arc::new(storage.load_or_create_identity()?);

        let registry = Arc::new(NeighborRegistry::new(config.registry_limits()));
        let overlay = Overlay::new(
            Arc::clone(&identity),
            Arc::clone(&registry),
            HandshakeVerifier::default().with_peer_id_binding(config.overlay.require_peer_id_binding),
            config.session_config(),
        );
        let publisher_config = config.publisher_config();
        let rendezvous = Arc::new(OverlayRendezvous::with_policy(
            Arc::clone(&overlay),
            config.dht.replication,
            Duration::from_secs(config.dht.op_timeout_secs),
            RecordPolicy::default()
                .with_max_ttl(publisher_config.descriptor_ttl)
                .with_max_entries(config.dht.max_records),
        ));
        let publisher = Arc::new(DescriptorPublisher::new(
            Arc::clone(&identity),
            Arc::clone(&rendezvous) as Arc<dyn Rendezvous>,
            publisher_config,
        ));
        let gossip = GossipService::new(identity.peer_id(), Arc::clone(&registry), config.gossip_config());
        let metrics = Arc::new(PeerMetricsService::with_store(
            config.reputation_config(),
            Arc::clone(&storage) as Arc<dyn soulmesh_reputation::MetricsStore>,
        )?);

        let library = Arc::new(MemoryLibraryIndex::new());
        if let Some(shared) = &config.shared_dir {
            for file in scan_dir(shared)? {
                library.add(file);
            }
            info!(dir = %shared.display(), files = library.len(), "Shared library indexed");
        }
        let moderation = moderation_from(&config);

        let scorer: Arc<dyn QualityScorer> = Arc::new(ExtensionQualityScorer);
        let search_transport = Arc::new(OverlaySearchTransport::new(
            Arc::clone(&overlay),
            Duration::from_secs(config.overlay.request_timeout_secs),
        ));
        let discovery = Arc::new(ContentDiscovery::new(
            Arc::clone(&search_transport) as Arc<dyn SearchTransport>,
            DiscoveryConfig::default(),
        ));
        // Legacy, HTTP and torrent sources belong to external bridges.
        let backends = vec![
            Backend::LocalLibrary(LocalLibraryBackend::new(
                Arc::clone(&library) as Arc<dyn LibraryIndex>,
                Arc::clone(&moderation),
                Arc::clone(&scorer),
            )),
            Backend::MeshDht(MeshBackend::new(discovery, scorer)),
        ];
        let planner = Arc::new(MultiSourcePlanner::new(
            backends,
            DomainGate::default(),
            Arc::clone(&moderation),
            Arc::clone(&metrics),
            config.planner_config(),
        ));
        let downloader = Arc::new(SwarmDownloader::new(
            Arc::new(NodeChunkFetcher::new(
                Arc::clone(&overlay),
                Duration::from_secs(config.transfer.chunk_timeout_secs),
            )),
            Arc::clone(&metrics),
            Arc::new(config.rescue_policy()),
            config.swarm_config(),
        ));
        let resolver = Arc::new(
            TransferResolver::new(Arc::clone(&planner), downloader).with_max_replans(config.transfer.max_replans),
        );
        let disaster = Arc::new(DisasterMode::new(planner));

        Ok(Self {
            config,
            storage,
            identity,
            overlay,
            rendezvous,
            publisher,
            gossip,
            metrics,
            library,
            moderation,
            search_transport,
            resolver,
            disaster,
        })
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn downloads_dir(&self) -> PathBuf {
        self.config.data_dir.join("downloads")
    }

    fn subscribe_variants(&self) -> Subscription {
        let storage = Arc::clone(&self.storage);
        self.gossip.subscribe(VARIANT_SEEN, move |message| {
            let Some(variant) = variant_from_gossip(&message) else {
                debug!(from = %message.originator_peer_id, "Ignoring malformed variant announcement");
                return;
            };
            if let Err(e) = storage.record_variant(&variant) {
                warn!(recording = %variant.recording_id, "Failed to record announced variant: {}", e);
            }
        })
    }

    /// Top up neighbors through the seeds and prune expired DHT records.
    async fn maintain_neighbors(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(NEIGHBOR_CHECK_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = self.rendezvous.prune();
                    if pruned > 0 {
                        debug!(pruned, "Expired DHT records pruned");
                    }
                    let registry = self.overlay.registry();
                    if registry.needs_more_neighbors() && !self.config.seeds.is_empty() {
                        debug!(neighbors = registry.len(), "Below neighbor minimum, dialing seeds");
                        if let Err(e) = self.rendezvous.bootstrap(&self.config.seeds).await {
                            debug!("Neighbor top-up failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let node = Arc::new(self);
        info!("Soulmesh node starting");
        info!("  Peer: {}", node.peer_id());
        info!("  P2P: {}", node.config.listen_addr);
        info!("  API: http://{}", node.config.api_addr);
        info!("  Data: {}", node.config.data_dir.display());

        let cancel = shutdown.child_token();
        let p2p_listener = TcpListener::bind(node.config.listen_addr).await?;
        let api_listener = TcpListener::bind(node.config.api_addr).await?;

        let handler = NodeFrameHandler::new(
            node.gossip.clone(),
            Arc::clone(&node.rendezvous),
            LocalSearchHandler::new(Arc::clone(&node.library) as Arc<dyn LibraryIndex>),
            ChunkServer::new(
                Arc::clone(&node.library) as Arc<dyn LibraryIndex>,
                Arc::clone(&node.moderation),
            ),
            Arc::clone(&node.metrics),
        );
        node.overlay.set_handler(Arc::new(handler));
        let _variants = node.subscribe_variants();

        let (queue, rx) = JobQueue::channel(JOB_QUEUE_CAPACITY);
        let runner = JobRunner::new(
            Arc::clone(&node.storage),
            Arc::clone(&node.resolver),
            node.downloads_dir(),
        )
        .with_library(Arc::clone(&node.library));

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(Arc::clone(&node.overlay).listen(p2p_listener, cancel.clone())),
            tokio::spawn(Arc::clone(&node.publisher).run(cancel.clone())),
            tokio::spawn(
                Arc::clone(&node.metrics).run_maintenance(
                    Duration::from_secs(node.config.reputation.maintenance_interval_secs),
                    cancel.clone(),
                ),
            ),
            tokio::spawn(Arc::clone(&node).maintain_neighbors(cancel.clone())),
        ];
        tasks.push(tokio::spawn(runner.run(queue.clone(), rx, cancel.clone())));

        let state = Arc::new(ApiState {
            storage: Arc::clone(&node.storage),
            registry: Arc::clone(node.overlay.registry()),
            metrics: Arc::clone(&node.metrics),
            disaster: Arc::clone(&node.disaster),
            gossip: node.gossip.clone(),
            jobs: queue,
            // Legacy-network search belongs to the external bridge.
            search_providers: vec![Arc::new(MeshSearchProvider::new(
                Arc::clone(&node.search_transport) as Arc<dyn SearchTransport>,
            )) as Arc<dyn SearchProvider>],
            search_timeout: Duration::from_secs(node.config.overlay.request_timeout_secs),
            local_peer_id: node.peer_id().to_string(),
        });
        let app = api::build_router(state);
        info!("HTTP server listening on {}", node.config.api_addr);
        let api_cancel = cancel.clone();
        let served = axum::serve(api_listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        // Stop everything, including when the API exited on its own.
        cancel.cancel();
        info!("Soulmesh node shutting down");
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks.iter_mut())).await.is_err() {
            warn!("Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
            for task in &tasks {
                task.abort();
            }
        }
        node.overlay.registry().dispose().await;
        if let Err(e) = node.metrics.flush() {
            warn!("Final metrics flush failed: {}", e);
        }
        node.storage.flush()?;
        served?;
        info!("Soulmesh node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use soulmesh_gossip::GossipConfig;
    use soulmesh_identity::{build_handshake_payload, Capability, HandshakeMessage};
    use soulmesh_overlay::{Frame, FrameKind, RegistryLimits};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config_in(dir: &tempfile::TempDir) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.data_dir = dir.path().join("node");
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.api_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[test]
    fn identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = SoulmeshNode::new(config_in(&dir)).unwrap().peer_id().to_string();
        let second = SoulmeshNode::new(config_in(&dir)).unwrap().peer_id().to_string();
        assert_eq!(first, second);
        assert!(first.starts_with("b3b3/"));
    }

    #[test]
    fn shared_dir_is_indexed_and_moderated() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("a.flac"), b"aaaa").unwrap();

        let mut config = config_in(&dir);
        config.shared_dir = Some(shared);
        let node = SoulmeshNode::new(config.clone()).unwrap();
        assert_eq!(node.library.len(), 1);
        let id = blake3::hash(b"aaaa").to_hex().to_string();
        assert!(!node.moderation.is_allowed(&id));

        drop(node);

        config.moderation.allowed_items = vec![id.clone()];
        let node = SoulmeshNode::new(config.clone()).unwrap();
        assert!(node.moderation.is_allowed(&id));
        assert!(!node.moderation.is_allowed("anything"));
        drop(node);

        config.moderation.allow_all = true;
        assert!(SoulmeshNode::new(config).unwrap().moderation.is_allowed("anything"));
    }

    #[tokio::test]
    async fn announced_variants_are_reassessed() {
        let registry = Arc::new(NeighborRegistry::new(RegistryLimits::default()));
        let gossip = GossipService::new("b3b3/a", registry, GossipConfig::default());
        let mut claimed = AudioVariant::new("v1", "rec-1", "FLAC", 44_100, Some(16), 200);
        // The sender claims a clean lossless file.
        claimed.transcode_suspect = false;
        claimed.quality_score = 1.0;
        let message = gossip.create_message(VARIANT_SEEN, serde_json::to_value(&claimed).unwrap(), 0);

        let variant = variant_from_gossip(&message).unwrap();
        assert!(variant.transcode_suspect);
        assert!(variant.quality_score < 0.5);

        let bad = gossip.create_message(VARIANT_SEEN, serde_json::json!({"recording_id": ""}), 0);
        assert!(variant_from_gossip(&bad).is_none());
    }

    /// Hello signed by one key while claiming another peer's id.
    fn borrowed_id_hello() -> String {
        let signer = PeerIdentity::generate();
        let claimed = PeerIdentity::generate();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let payload = build_handshake_payload(claimed.peer_id(), Capability::Mesh, now);
        let hello = HandshakeMessage {
            mesh_peer_id: claimed.peer_id().to_string(),
            timestamp: now,
            username: String::new(),
            public_key: BASE64.encode(signer.public_key_bytes()),
            signature: BASE64.encode(signer.sign(&payload)),
            capability: Capability::Mesh,
        };
        Frame::new(FrameKind::Handshake, &hello).unwrap().to_line().unwrap()
    }

    /// Neighbors admitted after a peer dials in with a borrowed id.
    async fn admitted_after_borrowed_id(config: NodeConfig) -> usize {
        let node = SoulmeshNode::new(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&node.overlay).listen(listener, cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(borrowed_id_hello().as_bytes()).await.unwrap();
        // A refused session is closed by the node; an admitted one stays open.
        let mut seen = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(500), stream.read_to_end(&mut seen)).await;

        let admitted = node.overlay.registry().len();
        cancel.cancel();
        admitted
    }

    #[tokio::test]
    async fn borrowed_peer_ids_are_refused_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        assert!(config.overlay.require_peer_id_binding);
        assert_eq!(admitted_after_borrowed_id(config).await, 0);

        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.overlay.require_peer_id_binding = false;
        assert_eq!(admitted_after_borrowed_id(config).await, 1);
    }

    #[tokio::test]
    async fn runs_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let node = SoulmeshNode::new(config_in(&dir)).unwrap();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(node.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        running.await.unwrap().unwrap();
    }
}
