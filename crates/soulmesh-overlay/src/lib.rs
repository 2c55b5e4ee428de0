//! Soulmesh Overlay
//!
//! The neighbor layer of the mesh: a bounded registry of live connections and
//! the TCP session machinery that feeds it.
//!
//! # Design
//!
//! The [`NeighborRegistry`] owns every connection. Its state sits behind one
//! mutex that is held only while admission decisions and counters change and
//! never across network I/O. Sessions talk to the registry through an outbox
//! channel and a cancellation lease.
//!
//! Neighbors exchange newline-delimited JSON [`Frame`]s. The first frame in
//! each direction is a signed handshake; a connection is admitted only after
//! that handshake verifies.

mod error;
mod frame;
mod registry;
mod session;

pub use error::{Error, Result};
pub use frame::{Frame, FrameKind, MAX_FRAME_BYTES};
pub use registry::{
    AdmitOutcome, CandidateConnection, NeighborInfo, NeighborLease, NeighborRegistry,
    RegistryLimits,
};
pub use session::{FrameHandler, Overlay, SessionConfig};
