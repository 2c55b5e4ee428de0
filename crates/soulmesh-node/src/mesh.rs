//! Overlay frame routing and chunk serving.
//!
//! Chunks travel as `chunk_request` / `chunk_response` frames with base64
//! data. A peer serves a chunk only for files moderation allows, so an
//! unlisted file is indistinguishable from a missing one.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use soulmesh_dht::OverlayRendezvous;
use soulmesh_discovery::{BackendRef, IndexedFile, LibraryIndex, LocalSearchHandler, ModerationOracle, SourceCandidate};
use soulmesh_gossip::GossipService;
use soulmesh_overlay::{Error as OverlayError, Frame, FrameHandler, FrameKind, Overlay};
use soulmesh_reputation::PeerMetricsService;
use soulmesh_transfer::{ChunkFetcher, ChunkSpec, FetchError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, trace, warn};

/// Largest chunk a peer will serve or request.
pub const MAX_CHUNK_LEN: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub item_id: String,
    pub filename: String,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    /// Base64 chunk bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkResponse {
    fn ok(data: &[u8]) -> Self {
        Self {
            data: Some(BASE64.encode(data)),
            error: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(reason.into()),
        }
    }
}

async fn read_range(path: &str, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serves byte ranges of shared files to neighbors.
pub struct ChunkServer {
    index: Arc<dyn LibraryIndex>,
    moderation: Arc<dyn ModerationOracle>,
}

impl ChunkServer {
    pub fn new(index: Arc<dyn LibraryIndex>, moderation: Arc<dyn ModerationOracle>) -> Self {
        Self { index, moderation }
    }

    /// By item id first, then by exact filename for sources found through
    /// metadata matches, whose item ids differ from the requester's.
    fn locate(&self, request: &ChunkRequest) -> Option<IndexedFile> {
        let by_id = self.index.find(&request.item_id, None, None).ok()?;
        let named = |f: &IndexedFile| request.filename.is_empty() || f.filename == request.filename;
        if let Some(file) = by_id.iter().find(|f| named(*f)).or(by_id.first()) {
            return Some(file.clone());
        }
        if request.filename.is_empty() {
            return None;
        }
        self.index
            .search(&request.filename)
            .ok()?
            .into_iter()
            .find(|f| f.filename == request.filename)
    }

    pub async fn serve(&self, request: &ChunkRequest) -> ChunkResponse {
        if request.len == 0 || request.len > MAX_CHUNK_LEN {
            return ChunkResponse::failed(format!("chunk length must be 1..={MAX_CHUNK_LEN}"));
        }
        let Some(file) = self.locate(request) else {
            return ChunkResponse::failed("not available");
        };
        if !self.moderation.is_allowed(&file.item_id) {
            debug!(item = %file.item_id, "Chunk request for unlisted item refused");
            return ChunkResponse::failed("not available");
        }
        let in_bounds = request
            .offset
            .checked_add(request.len)
            .is_some_and(|end| end <= file.size);
        if !in_bounds {
            return ChunkResponse::failed("range out of bounds");
        }
        match read_range(&file.path, request.offset, request.len).await {
            Ok(data) => ChunkResponse::ok(&data),
            Err(e) => {
                warn!(path = %file.path, "Chunk read failed: {}", e);
                ChunkResponse::failed("read failed")
            }
        }
    }

    pub async fn handle_frame(&self, frame: &Frame) -> Option<Frame> {
        let response = match frame.decode::<ChunkRequest>() {
            Ok(request) => self.serve(&request).await,
            Err(_) => ChunkResponse::failed("malformed chunk request"),
        };
        Frame::new(FrameKind::ChunkResponse, &response)
            .ok()
            .map(|reply| reply.in_reply_to(frame))
    }
}

/// Fetches chunks from local files and mesh peers.
pub struct NodeChunkFetcher {
    overlay: Arc<Overlay>,
    timeout: Duration,
}

impl NodeChunkFetcher {
    pub fn new(overlay: Arc<Overlay>, timeout: Duration) -> Self {
        Self { overlay, timeout }
    }

    async fn fetch_remote(
        &self,
        peer_id: &str,
        request: ChunkRequest,
    ) -> Result<Bytes, FetchError> {
        let frame = Frame::new(FrameKind::ChunkRequest, &request).map_err(|e| FetchError::Failed(e.to_string()))?;
        let reply = self
            .overlay
            .request(peer_id, frame, Some(self.timeout))
            .await
            .map_err(|e| match e {
                OverlayError::RequestTimeout => FetchError::Timeout,
                OverlayError::PeerNotConnected(p) => FetchError::Unavailable(format!("{p} not connected")),
                other => FetchError::Failed(other.to_string()),
            })?;
        let response: ChunkResponse = reply.decode().map_err(|e| FetchError::Failed(e.to_string()))?;
        match (response.data, response.error) {
            (Some(data), None) => BASE64
                .decode(data)
                .map(Bytes::from)
                .map_err(|e| FetchError::Failed(format!("bad chunk encoding: {e}"))),
            (_, Some(reason)) => Err(FetchError::Unavailable(reason)),
            (None, None) => Err(FetchError::Failed("empty chunk response".into())),
        }
    }
}

#[async_trait]
impl ChunkFetcher for NodeChunkFetcher {
    async fn fetch_chunk(&self, source: &SourceCandidate, chunk: &ChunkSpec) -> Result<Bytes, FetchError> {
        match &source.backend_ref {
            BackendRef::LocalPath { path } => read_range(path, chunk.offset, chunk.len)
                .await
                .map(Bytes::from)
                .map_err(|e| FetchError::Failed(e.to_string())),
            BackendRef::MeshPeer { peer_id, filename } => {
                trace!(peer = %peer_id, chunk = chunk.index, "Requesting chunk");
                let request = ChunkRequest {
                    item_id: source.item_id.clone(),
                    filename: filename.clone(),
                    offset: chunk.offset,
                    len: chunk.len,
                };
                self.fetch_remote(peer_id, request).await
            }
            other => Err(FetchError::Unavailable(format!(
                "no chunk transport for {} sources",
                other.backend()
            ))),
        }
    }
}

/// Routes inbound overlay frames to the node's services.
pub struct NodeFrameHandler {
    gossip: GossipService,
    rendezvous: Arc<OverlayRendezvous>,
    search: LocalSearchHandler,
    chunks: ChunkServer,
    metrics: Arc<PeerMetricsService>,
}

impl NodeFrameHandler {
    pub fn new(
        gossip: GossipService,
        rendezvous: Arc<OverlayRendezvous>,
        search: LocalSearchHandler,
        chunks: ChunkServer,
        metrics: Arc<PeerMetricsService>,
    ) -> Self {
        Self {
            gossip,
            rendezvous,
            search,
            chunks,
            metrics,
        }
    }
}

#[async_trait]
impl FrameHandler for NodeFrameHandler {
    async fn handle_frame(&self, from: &str, frame: Frame) -> Option<Frame> {
        if self.metrics.is_peer_banned(from) {
            trace!(peer = %from, kind = ?frame.kind, "Dropping frame from banned peer");
            return None;
        }
        match frame.kind {
            FrameKind::Gossip => {
                self.gossip.handle_frame(from, &frame, soulmesh_dht::now_ms()).await;
                None
            }
            FrameKind::DhtStore => {
                self.rendezvous.handle_store(&frame);
                None
            }
            FrameKind::DhtFind => self.rendezvous.handle_find(&frame).map(|reply| reply.in_reply_to(&frame)),
            FrameKind::SearchRequest => self.search.handle_frame(&frame),
            FrameKind::ChunkRequest => self.chunks.handle_frame(&frame).await,
            other => {
                debug!(peer = %from, kind = ?other, "Unsolicited frame ignored");
                None
            }
        }
    }

    async fn on_neighbor_up(&self, peer_id: &str) {
        info!(peer = %peer_id, "Neighbor up");
    }

    async fn on_neighbor_down(&self, peer_id: &str) {
        info!(peer = %peer_id, "Neighbor down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soulmesh_discovery::{MemoryLibraryIndex, StaticModeration};
    use soulmesh_gossip::GossipConfig;
    use soulmesh_identity::{HandshakeVerifier, PeerIdentity};
    use soulmesh_overlay::{NeighborRegistry, RegistryLimits, SessionConfig};
    use soulmesh_reputation::ReputationConfig;
    use uuid::Uuid;

    fn shared_file(dir: &tempfile::TempDir, name: &str, data: &[u8], item: &str) -> IndexedFile {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        IndexedFile::new(item, path.to_string_lossy().into_owned(), data.len() as u64)
    }

    fn request(item: &str, filename: &str, offset: u64, len: u64) -> ChunkRequest {
        ChunkRequest {
            item_id: item.into(),
            filename: filename.into(),
            offset,
            len,
        }
    }

    fn decode(response: &ChunkResponse) -> Vec<u8> {
        BASE64.decode(response.data.as_ref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn serves_allowed_ranges_only() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryLibraryIndex::with_files([
            shared_file(&dir, "song.flac", b"0123456789", "item-a"),
            shared_file(&dir, "secret.flac", b"hidden", "item-b"),
        ]));
        let moderation = Arc::new(StaticModeration::new());
        moderation.allow("item-a");
        let server = ChunkServer::new(index, moderation);

        let ok = server.serve(&request("item-a", "song.flac", 2, 4)).await;
        assert_eq!(decode(&ok), b"2345");

        let hidden = server.serve(&request("item-b", "secret.flac", 0, 6)).await;
        assert_eq!(hidden.error.as_deref(), Some("not available"));
        let missing = server.serve(&request("item-z", "nothing.flac", 0, 1)).await;
        assert_eq!(missing.error, hidden.error);

        let past_end = server.serve(&request("item-a", "song.flac", 8, 4)).await;
        assert_eq!(past_end.error.as_deref(), Some("range out of bounds"));
        let huge = server.serve(&request("item-a", "song.flac", 0, MAX_CHUNK_LEN + 1)).await;
        assert!(huge.data.is_none());
    }

    #[tokio::test]
    async fn metadata_sources_resolve_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryLibraryIndex::with_files([shared_file(
            &dir,
            "Artist - Track.flac",
            b"abcdef",
            "their-item",
        )]));
        let moderation = Arc::new(StaticModeration::new());
        moderation.allow("their-item");
        let server = ChunkServer::new(index, moderation);

        let response = server.serve(&request("my-item", "Artist - Track.flac", 0, 3)).await;
        assert_eq!(decode(&response), b"abc");
    }

    #[tokio::test]
    async fn local_sources_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = shared_file(&dir, "local.flac", b"local bytes", "item-l");
        let registry = Arc::new(NeighborRegistry::new(RegistryLimits::default()));
        let overlay = Overlay::new(
            Arc::new(PeerIdentity::generate()),
            registry,
            HandshakeVerifier::default(),
            SessionConfig::default(),
        );
        let fetcher = NodeChunkFetcher::new(overlay, Duration::from_secs(1));
        let source = SourceCandidate::new("item-l", BackendRef::LocalPath { path: file.path.clone() }, 0);
        let chunk = ChunkSpec {
            index: 0,
            offset: 6,
            len: 5,
            hash: None,
        };
        assert_eq!(&fetcher.fetch_chunk(&source, &chunk).await.unwrap()[..], b"bytes");

        let remote = SourceCandidate::new(
            "item-l",
            BackendRef::MeshPeer {
                peer_id: "nobody".into(),
                filename: "local.flac".into(),
            },
            0,
        );
        assert!(matches!(
            fetcher.fetch_chunk(&remote, &chunk).await,
            Err(FetchError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn handler_routes_requests_and_drops_banned_peers() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryLibraryIndex::with_files([shared_file(&dir, "song.flac", b"xyz", "item-a")]));
        let moderation = Arc::new(StaticModeration::new());
        moderation.allow("item-a");

        let registry = Arc::new(NeighborRegistry::new(RegistryLimits::default()));
        let identity = Arc::new(PeerIdentity::generate());
        let overlay = Overlay::new(
            identity.clone(),
            registry.clone(),
            HandshakeVerifier::default(),
            SessionConfig::default(),
        );
        let metrics = Arc::new(PeerMetricsService::new(ReputationConfig::default()));
        let handler = NodeFrameHandler::new(
            GossipService::new(identity.peer_id(), registry, GossipConfig::default()),
            Arc::new(OverlayRendezvous::new(overlay, 3, Duration::from_secs(1))),
            LocalSearchHandler::new(index.clone()),
            ChunkServer::new(index, moderation),
            metrics.clone(),
        );

        let chunk = Frame::new(FrameKind::ChunkRequest, &request("item-a", "song.flac", 0, 3))
            .unwrap()
            .with_id(Uuid::new_v4());
        let reply = handler.handle_frame("peer-b", chunk.clone()).await.unwrap();
        assert_eq!(reply.kind, FrameKind::ChunkResponse);
        assert_eq!(reply.reply_to, chunk.id);
        assert_eq!(decode(&reply.decode().unwrap()), b"xyz");

        let find = Frame::new(FrameKind::DhtFind, &serde_json::json!({ "key": soulmesh_dht::hash_key(b"k") }))
            .unwrap()
            .with_id(Uuid::new_v4());
        let found = handler.handle_frame("peer-b", find.clone()).await.unwrap();
        assert_eq!(found.kind, FrameKind::DhtFound);
        assert_eq!(found.reply_to, find.id);

        assert!(handler
            .handle_frame("peer-b", Frame::empty(FrameKind::ChunkResponse))
            .await
            .is_none());

        metrics.ban_peer("peer-b", "spam");
        assert!(handler.handle_frame("peer-b", chunk).await.is_none());
    }
}
