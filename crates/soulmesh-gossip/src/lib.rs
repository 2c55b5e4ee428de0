//! Soulmesh Gossip
//!
//! Bounded flooding of typed messages across overlay neighbors. There is no
//! spanning tree: every node forwards a hop-incremented copy to all neighbors
//! except the sender, and the flood is bounded by hop count, TTL and a
//! recent-id dedup window.
//!
//! Messages may be scoped to a realm. A node delivers and forwards only
//! realms it belongs to, compared case-insensitively. Untagged messages are
//! the default realm on single-realm nodes and are dropped on multi-realm
//! nodes.
//!
//! Each subscriber has its own bounded queue drained by its own task, so a
//! slow or panicking subscriber never stalls forwarding.

mod dedup;
mod error;
mod message;
mod service;

pub use dedup::RecentIds;
pub use error::{Error, Result};
pub use message::{
    GossipMessage, GossipMetadata, Priority, Reliability, DEFAULT_MAX_HOPS, DEFAULT_TTL_MS,
};
pub use service::{GossipConfig, GossipService, ReceiveOutcome, Subscription};
