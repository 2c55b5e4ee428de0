//! Error types for soulmesh-overlay.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::frame::{FrameKind, MAX_FRAME_BYTES};
use crate::registry::AdmitOutcome;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame exceeds the {0} byte limit")]
    FrameTooLarge(usize),

    #[error("handshake rejected: {0}")]
    Handshake(#[from] soulmesh_identity::HandshakeRejection),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("expected handshake, got {0:?}")]
    UnexpectedFrame(FrameKind),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("refusing connection to self")]
    SelfConnection,

    #[error("not admitted: {0:?}")]
    NotAdmitted(AdmitOutcome),

    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("overlay is shut down")]
    Shutdown,
}

impl From<LinesCodecError> for Error {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => Error::FrameTooLarge(MAX_FRAME_BYTES),
            LinesCodecError::Io(e) => Error::Io(e),
        }
    }
}
