//! Remote search over overlay frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use soulmesh_overlay::{Frame, FrameKind, Overlay};
use tracing::debug;

use crate::error::Result;
use crate::search::{LocalSearchHandler, SearchRequest, SearchResponse};

/// Sends search requests to mesh peers.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    /// Peers currently reachable for search.
    fn peers(&self) -> Vec<String>;

    async fn search(&self, peer_id: &str, request: SearchRequest) -> Result<SearchResponse>;
}

pub struct OverlaySearchTransport {
    overlay: Arc<Overlay>,
    timeout: Duration,
}

impl OverlaySearchTransport {
    pub fn new(overlay: Arc<Overlay>, timeout: Duration) -> Self {
        Self { overlay, timeout }
    }
}

#[async_trait]
impl SearchTransport for OverlaySearchTransport {
    fn peers(&self) -> Vec<String> {
        self.overlay.registry().peer_ids()
    }

    async fn search(&self, peer_id: &str, request: SearchRequest) -> Result<SearchResponse> {
        let frame = Frame::new(FrameKind::SearchRequest, &request)?;
        let reply = self.overlay.request(peer_id, frame, Some(self.timeout)).await?;
        Ok(reply.decode::<SearchResponse>()?)
    }
}

impl LocalSearchHandler {
    /// Answer a `search_request` frame. Undecodable requests still get a
    /// reply carrying an error.
    pub fn handle_frame(&self, frame: &Frame) -> Option<Frame> {
        let response = match frame.decode::<SearchRequest>() {
            Ok(request) => self.handle(&request),
            Err(e) => {
                debug!("Undecodable search request: {}", e);
                SearchResponse::failed(String::new(), "malformed search request")
            }
        };
        Frame::new(FrameKind::SearchResponse, &response)
            .ok()
            .map(|reply| reply.in_reply_to(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexedFile, MemoryLibraryIndex};
    use uuid::Uuid;

    #[test]
    fn frame_round_trip_through_handler() {
        let index = Arc::new(MemoryLibraryIndex::with_files([IndexedFile::new("i", "/x/song.flac", 7)]));
        let handler = LocalSearchHandler::new(index);
        let request = Frame::new(FrameKind::SearchRequest, &SearchRequest::new("song", 5))
            .unwrap()
            .with_id(Uuid::new_v4());

        let reply = handler.handle_frame(&request).unwrap();
        assert_eq!(reply.kind, FrameKind::SearchResponse);
        assert_eq!(reply.reply_to, request.id);
        let response: SearchResponse = reply.decode().unwrap();
        assert_eq!(response.files.len(), 1);
        assert_eq!(response.files[0].size, 7);
    }

    #[test]
    fn garbage_request_gets_error_reply() {
        let handler = LocalSearchHandler::new(Arc::new(MemoryLibraryIndex::new()));
        let frame = Frame::new(FrameKind::SearchRequest, &serde_json::json!({"bogus": true})).unwrap();
        let response: SearchResponse = handler.handle_frame(&frame).unwrap().decode().unwrap();
        assert!(response.error.is_some());
    }
}
