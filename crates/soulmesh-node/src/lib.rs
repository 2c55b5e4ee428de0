//! Soulmesh Node
//!
//! The daemon that runs one mesh peer: overlay sessions, DHT rendezvous,
//! gossip, reputation, multi-source transfers and the HTTP control API.
//!
//! # Architecture
//!
//! - **Config**: defaults, TOML file, then `SOULMESH_*` environment
//! - **Storage**: sled trees for identity, peer metrics, variants and jobs
//! - **Mesh**: overlay frame routing, chunk serving and fetching
//! - **Jobs**: append-only bulk acquisition jobs and their runner
//! - **Disaster mode**: mesh-only planning while the legacy server is down
//! - **Actions**: search results routed to jobs
//! - **API**: axum endpoints for status, catalog queries, search and jobs
//!
//! # Example
//!
//! ```no_run
//! use soulmesh_node::{NodeConfig, SoulmeshNode};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = SoulmeshNode::new(NodeConfig::load()?)?;
//!     node.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod api;
pub mod config;
pub mod disaster;
pub mod error;
pub mod jobs;
pub mod library;
pub mod mesh;
pub mod node;
pub mod storage;

pub use actions::NodeActionTarget;
pub use config::NodeConfig;
pub use disaster::{DisasterMode, DisasterStatus};
pub use error::{Error, Result};
pub use jobs::{CreateJobRequest, Job, JobItemStatus, JobQueue, JobRunner, JobStatus};
pub use mesh::{ChunkServer, NodeChunkFetcher, NodeFrameHandler};
pub use node::SoulmeshNode;
pub use storage::Storage;
