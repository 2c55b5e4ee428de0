//! TCP sessions between overlay neighbors.
//!
//! Each connection is a pair of tasks: a reader that parses frames and
//! dispatches them, and a writer that drains the connection's bounded
//! outbox. Both stop when the connection's lease token is cancelled
//! (eviction, disposal) or the socket closes.
//!
//! ```text
//! connect/accept -> send handshake -> read handshake -> verify -> try_admit
//!                -> spawn writer + reader
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use soulmesh_identity::{unix_now, Capability, HandshakeMessage, HandshakeVerifier, PeerIdentity};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameKind, MAX_FRAME_BYTES};
use crate::registry::{CandidateConnection, NeighborLease, NeighborRegistry};

/// Newline-delimited frames, never buffering more than one frame's worth.
type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;

/// Receives frames from neighbors.
///
/// Return `Some(frame)` from `handle_frame` to reply to a request; the
/// session fills in `reply_to`.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, from: &str, frame: Frame) -> Option<Frame>;

    async fn on_neighbor_up(&self, _peer_id: &str) {}

    async fn on_neighbor_down(&self, _peer_id: &str) {}
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub capability: Capability,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub outbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            capability: Capability::Mesh,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            outbox_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// The overlay endpoint: accepts and dials neighbors, routes frames.
pub struct Overlay {
    identity: Arc<PeerIdentity>,
    registry: Arc<NeighborRegistry>,
    verifier: HandshakeVerifier,
    config: SessionConfig,
    handler: OnceLock<Arc<dyn FrameHandler>>,
    pending: DashMap<Uuid, oneshot::Sender<Frame>>,
}

impl Overlay {
    pub fn new(
        identity: Arc<PeerIdentity>,
        registry: Arc<NeighborRegistry>,
        verifier: HandshakeVerifier,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            registry,
            verifier,
            config,
            handler: OnceLock::new(),
            pending: DashMap::new(),
        })
    }

    /// Install the frame handler. Only the first call takes effect.
    pub fn set_handler(&self, handler: Arc<dyn FrameHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    pub fn registry(&self) -> &Arc<NeighborRegistry> {
        &self.registry
    }

    pub fn local_peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// Accept inbound connections until `cancel` fires.
    pub async fn listen(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Overlay listening on {}", addr),
            Err(e) => warn!("Overlay listener has no local address: {}", e),
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Incoming overlay connection from {}", addr);
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.establish(stream, addr).await {
                                debug!("Inbound session from {} not established: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }
        info!("Overlay listener stopped");
    }

    /// Dial a neighbor. Returns its peer id once admitted.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<String> {
        if self.registry.is_disposed() {
            return Err(Error::Shutdown);
        }
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Io(std::io::ErrorKind::TimedOut.into()))??;
        let remote = stream.peer_addr().unwrap_or(addr);
        self.establish(stream, remote).await
    }

    async fn establish(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<String> {
        let started = tokio::time::Instant::now();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        let hello = HandshakeMessage::create(
            &self.identity,
            self.config.username.clone(),
            self.config.capability,
            unix_now(),
        );
        write_frame(&mut writer, &Frame::new(FrameKind::Handshake, &hello)?).await?;

        let line = tokio::time::timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| Error::HandshakeTimeout)?
            .ok_or(Error::ConnectionClosed)??;
        let frame = Frame::parse_line(&line)?;
        if frame.kind != FrameKind::Handshake {
            return Err(Error::UnexpectedFrame(frame.kind));
        }
        let message: HandshakeMessage = frame.decode()?;
        let peer = self.verifier.validate(&message, unix_now())?;
        if peer.peer_id == self.identity.peer_id() {
            return Err(Error::SelfConnection);
        }

        let (tx, rx) = mpsc::channel(self.config.outbox_capacity);
        let candidate = CandidateConnection::new(peer.peer_id.clone(), addr)
            .with_latency(started.elapsed())
            .with_outbox(tx);
        let outcome = self.registry.try_admit(candidate);
        if !outcome.is_admitted() {
            debug!(peer = %peer.peer_id, ?outcome, "neighbor not admitted");
            return Err(Error::NotAdmitted(outcome));
        }
        let lease = self
            .registry
            .lease(&peer.peer_id)
            .ok_or_else(|| Error::PeerNotConnected(peer.peer_id.clone()))?;
        info!(peer = %peer.peer_id, %addr, "neighbor admitted");

        tokio::spawn(run_writer(writer, rx, lease.cancel.clone(), peer.peer_id.clone()));
        let this = Arc::clone(self);
        let peer_id = peer.peer_id.clone();
        tokio::spawn(async move {
            if let Some(handler) = this.handler.get() {
                handler.on_neighbor_up(&peer_id).await;
            }
            this.run_reader(reader, &peer_id, &lease).await;
            this.registry.remove_connection(&peer_id, lease.connection_id);
            if let Some(handler) = this.handler.get() {
                handler.on_neighbor_down(&peer_id).await;
            }
            info!(peer = %peer_id, "neighbor disconnected");
        });

        Ok(peer.peer_id)
    }

    async fn run_reader(
        self: &Arc<Self>,
        mut reader: LineReader,
        peer_id: &str,
        lease: &NeighborLease,
    ) {
        loop {
            tokio::select! {
                _ = lease.cancel.cancelled() => break,
                next = reader.next() => match next {
                    None => break,
                    Some(Ok(line)) => match Frame::parse_line(&line) {
                        Ok(frame) => self.dispatch(peer_id, frame).await,
                        Err(e) => debug!(peer = %peer_id, "malformed frame: {}", e),
                    },
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(peer = %peer_id, "dropping connection: frame over {} bytes", MAX_FRAME_BYTES);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(peer = %peer_id, "read error: {}", e);
                        break;
                    }
                },
            }
        }
        lease.cancel.cancel();
    }

    async fn dispatch(self: &Arc<Self>, peer_id: &str, frame: Frame) {
        if let Some(request_id) = frame.reply_to {
            match self.pending.remove(&request_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(frame);
                }
                None => trace!(peer = %peer_id, "late reply {}", request_id),
            }
            return;
        }

        let Some(handler) = self.handler.get().cloned() else {
            trace!(peer = %peer_id, "no handler installed, dropping {:?}", frame.kind);
            return;
        };

        // Handlers run in their own task so a panic stays contained.
        let wants_reply = frame.kind.is_request() && frame.id.is_some();
        let registry = Arc::clone(&self.registry);
        let from = peer_id.to_string();
        let task = tokio::spawn(async move {
            let request = frame.clone();
            let reply = handler.handle_frame(&from, frame).await;
            if let (true, Some(reply)) = (wants_reply, reply) {
                registry.send(&from, reply.in_reply_to(&request));
            }
        });

        let peer = peer_id.to_string();
        let supervised = async move {
            if let Err(e) = task.await {
                error!(peer = %peer, "frame handler failed: {}", e);
            }
        };

        // One-way frames are handled in order; requests run concurrently.
        if wants_reply {
            tokio::spawn(supervised);
        } else {
            supervised.await;
        }
    }

    /// Send a one-way frame to a neighbor.
    pub fn send(&self, peer_id: &str, frame: Frame) -> bool {
        self.registry.send(peer_id, frame)
    }

    /// Send a request frame and wait for the matching reply.
    pub async fn request(&self, peer_id: &str, frame: Frame, timeout: Option<Duration>) -> Result<Frame> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if !self.registry.send(peer_id, frame.with_id(id)) {
            self.pending.remove(&id);
            return Err(Error::PeerNotConnected(peer_id.to_string()));
        }

        let wait = timeout.unwrap_or(self.config.request_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::RequestTimeout)
            }
        }
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    peer_id: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbox.recv() => match next {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(peer = %peer_id, "write error: {}", e);
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let line = frame.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}
