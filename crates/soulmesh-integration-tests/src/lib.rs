//! Fixtures for end-to-end scenarios.
//!
//! Two flavours of mesh:
//!
//! - [`MemoryMesh`]: peers answer searches from their own library and serve
//!   chunks from memory, with no sockets. Suited to paused-time tests.
//! - [`LoopbackNode`]: a real overlay session on 127.0.0.1 routing frames
//!   through the node's frame handler, with shared files on disk.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use soulmesh_dht::OverlayRendezvous;
use soulmesh_discovery::{
    Backend, BackendRef, ContentDiscovery, DiscoveryConfig, Error as DiscoveryError,
    ExtensionQualityScorer, IndexedFile, LibraryIndex, LocalSearchHandler, MemoryLibraryIndex,
    MeshBackend, ModerationOracle, SearchRequest, SearchResponse, SearchTransport,
    SourceCandidate, StaticModeration,
};
use soulmesh_gossip::{GossipConfig, GossipService};
use soulmesh_identity::{HandshakeVerifier, PeerIdentity};
use soulmesh_node::{ChunkServer, NodeFrameHandler};
use soulmesh_overlay::{NeighborRegistry, Overlay, RegistryLimits, SessionConfig};
use soulmesh_reputation::{PeerMetricsService, ReputationConfig};
use soulmesh_transfer::{
    ChunkFetcher, ChunkSpec, DomainGate, FetchError, MultiSourcePlanner, PlannerConfig,
    SwarmConfig, SwarmDownloader, ThroughputRescue, TransferResolver,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Log to the test harness when `RUST_LOG` is set. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` every 10ms for up to two seconds.
pub async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Like [`wait_for`] for conditions that need to await.
pub async fn wait_for_async<F, Fut>(cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Deterministic test content.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehaviour {
    Healthy,
    /// Serve this many chunks, then never answer again.
    StallAfter(usize),
    /// Every search and chunk request fails.
    Down,
}

struct MemoryPeer {
    index: Arc<MemoryLibraryIndex>,
    search: LocalSearchHandler,
    content: HashMap<String, Bytes>,
    behaviour: PeerBehaviour,
}

impl MemoryPeer {
    fn new(behaviour: PeerBehaviour) -> Self {
        let index = Arc::new(MemoryLibraryIndex::new());
        Self {
            search: LocalSearchHandler::new(Arc::clone(&index) as Arc<dyn LibraryIndex>),
            index,
            content: HashMap::new(),
            behaviour,
        }
    }
}

/// Peers in one process. Implements both the search transport and the
/// chunk fetcher a planner and swarm need.
pub struct MemoryMesh {
    peers: BTreeMap<String, MemoryPeer>,
    requested: Mutex<HashMap<(String, String), usize>>,
    chunk_delay: Duration,
}

impl Default for MemoryMesh {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
            requested: Mutex::new(HashMap::new()),
            chunk_delay: Duration::from_millis(50),
        }
    }
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer_id: &str, behaviour: PeerBehaviour) -> Self {
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| MemoryPeer::new(behaviour))
            .behaviour = behaviour;
        self
    }

    /// Share `data` from `peer_id` under `file`'s name.
    pub fn share(mut self, peer_id: &str, file: IndexedFile, data: impl Into<Bytes>) -> Self {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| MemoryPeer::new(PeerBehaviour::Healthy));
        peer.content.insert(file.filename.clone(), data.into());
        peer.index.add(file);
        self
    }

    /// Chunk requests `peer_id` received for `filename`.
    pub fn requests_for(&self, peer_id: &str, filename: &str) -> usize {
        self.requested
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(peer_id.to_string(), filename.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn record_request(&self, peer_id: &str, filename: &str) -> usize {
        let mut requested = self.requested.lock().unwrap_or_else(|p| p.into_inner());
        *requested
            .entry((peer_id.to_string(), filename.to_string()))
            .or_default() += 1;
        requested
            .iter()
            .filter(|((peer, _), _)| peer == peer_id)
            .map(|(_, n)| n)
            .sum()
    }
}

#[async_trait]
impl SearchTransport for MemoryMesh {
    fn peers(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    async fn search(&self, peer_id: &str, request: SearchRequest) -> soulmesh_discovery::Result<SearchResponse> {
        let unavailable = |reason: &str| DiscoveryError::BackendUnavailable {
            backend: peer_id.to_string(),
            reason: reason.to_string(),
        };
        let peer = self.peers.get(peer_id).ok_or_else(|| unavailable("unknown peer"))?;
        if peer.behaviour == PeerBehaviour::Down {
            return Err(unavailable("connection refused"));
        }
        Ok(peer.search.handle(&request))
    }
}

#[async_trait]
impl ChunkFetcher for MemoryMesh {
    async fn fetch_chunk(&self, source: &SourceCandidate, chunk: &ChunkSpec) -> Result<Bytes, FetchError> {
        let BackendRef::MeshPeer { peer_id, filename } = &source.backend_ref else {
            return Err(FetchError::Unavailable(format!("{} sources are not in this mesh", source.backend)));
        };
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| FetchError::Unavailable(format!("{peer_id} unknown")))?;
        let served = self.record_request(peer_id, filename);
        tokio::time::sleep(self.chunk_delay).await;
        match peer.behaviour {
            PeerBehaviour::Down => return Err(FetchError::Unavailable("connection refused".into())),
            PeerBehaviour::StallAfter(n) if served > n => std::future::pending::<()>().await,
            _ => {}
        }
        let data = peer
            .content
            .get(filename)
            .ok_or_else(|| FetchError::Unavailable("not available".into()))?;
        let start = chunk.offset as usize;
        let end = start + chunk.len as usize;
        if end > data.len() {
            return Err(FetchError::Failed("range out of bounds".into()));
        }
        Ok(data.slice(start..end))
    }
}

/// A requesting node's planning and transfer stack over mesh peers only.
pub struct MeshClient {
    pub planner: Arc<MultiSourcePlanner>,
    pub resolver: TransferResolver,
    pub metrics: Arc<PeerMetricsService>,
    pub moderation: Arc<StaticModeration>,
}

/// Stalls are judged after two seconds; throughput never is.
pub fn stall_rescue() -> ThroughputRescue {
    ThroughputRescue::default()
        .with_stall_after(Duration::from_secs(2))
        .with_grace(Duration::from_secs(3600))
}

pub fn small_chunks() -> SwarmConfig {
    SwarmConfig::default()
        .with_chunk_size(64)
        .with_chunk_timeout(Duration::from_secs(5))
}

pub fn mesh_client(
    transport: Arc<dyn SearchTransport>,
    fetcher: Arc<dyn ChunkFetcher>,
    swarm: SwarmConfig,
) -> MeshClient {
    let moderation = Arc::new(StaticModeration::new());
    let metrics = Arc::new(PeerMetricsService::new(ReputationConfig::default()));
    let discovery = Arc::new(ContentDiscovery::new(transport, DiscoveryConfig::default()));
    let planner = Arc::new(MultiSourcePlanner::new(
        vec![Backend::MeshDht(MeshBackend::new(discovery, Arc::new(ExtensionQualityScorer)))],
        DomainGate::default(),
        Arc::clone(&moderation) as Arc<dyn ModerationOracle>,
        Arc::clone(&metrics),
        PlannerConfig::default(),
    ));
    let downloader = Arc::new(SwarmDownloader::new(
        fetcher,
        Arc::clone(&metrics),
        Arc::new(stall_rescue()),
        swarm,
    ));
    MeshClient {
        resolver: TransferResolver::new(Arc::clone(&planner), downloader),
        planner,
        metrics,
        moderation,
    }
}

/// One overlay peer on loopback, routing frames through the node's handler.
pub struct LoopbackNode {
    pub identity: Arc<PeerIdentity>,
    pub overlay: Arc<Overlay>,
    pub gossip: GossipService,
    pub rendezvous: Arc<OverlayRendezvous>,
    pub metrics: Arc<PeerMetricsService>,
    pub library: Arc<MemoryLibraryIndex>,
    pub moderation: Arc<StaticModeration>,
    pub addr: SocketAddr,
    shared: TempDir,
}

impl LoopbackNode {
    pub async fn start(cancel: &CancellationToken) -> std::io::Result<Self> {
        let identity = Arc::new(PeerIdentity::generate());
        let registry = Arc::new(NeighborRegistry::new(RegistryLimits::default()));
        let overlay = Overlay::new(
            Arc::clone(&identity),
            Arc::clone(&registry),
            HandshakeVerifier::default().with_peer_id_binding(true),
            SessionConfig::default().with_request_timeout(Duration::from_secs(2)),
        );
        let rendezvous = Arc::new(OverlayRendezvous::new(Arc::clone(&overlay), 3, Duration::from_secs(2)));
        let gossip = GossipService::new(identity.peer_id(), registry, GossipConfig::default());
        let metrics = Arc::new(PeerMetricsService::new(ReputationConfig::default()));
        let library = Arc::new(MemoryLibraryIndex::new());
        let moderation = Arc::new(StaticModeration::new());

        let index = Arc::clone(&library) as Arc<dyn LibraryIndex>;
        overlay.set_handler(Arc::new(NodeFrameHandler::new(
            gossip.clone(),
            Arc::clone(&rendezvous),
            LocalSearchHandler::new(Arc::clone(&index)),
            ChunkServer::new(index, Arc::clone(&moderation) as Arc<dyn ModerationOracle>),
            Arc::clone(&metrics),
        )));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(Arc::clone(&overlay).listen(listener, cancel.clone()));

        Ok(Self {
            identity,
            overlay,
            gossip,
            rendezvous,
            metrics,
            library,
            moderation,
            addr,
            shared: tempfile::tempdir()?,
        })
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// Write `data` to the shared directory, index it and allow it.
    pub fn share(
        &self,
        item_id: &str,
        filename: &str,
        data: &[u8],
        recording_id: Option<&str>,
    ) -> std::io::Result<IndexedFile> {
        let path = self.shared.path().join(filename);
        std::fs::write(&path, data)?;
        let mut file = IndexedFile::new(item_id, path.to_string_lossy().into_owned(), data.len() as u64);
        if let Some(rec) = recording_id {
            file = file.with_recording(rec);
        }
        self.library.add(file.clone());
        self.moderation.allow(item_id);
        Ok(file)
    }

    /// Dial `other` and wait until both registries list the session.
    pub async fn connect(&self, other: &LoopbackNode) -> soulmesh_overlay::Result<()> {
        self.overlay.connect(other.addr).await?;
        let (mine, theirs) = (self.overlay.registry(), other.overlay.registry());
        wait_for(|| mine.contains(other.peer_id()) && theirs.contains(self.peer_id())).await;
        Ok(())
    }
}
