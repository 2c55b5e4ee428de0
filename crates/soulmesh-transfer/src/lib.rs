//! Soulmesh Transfer
//!
//! Turns a wanted item into a ranked multi-source plan and executes it as a
//! chunked swarm download.
//!
//! # Design
//!
//! - [`MultiSourcePlanner`] gathers candidates from every enabled backend,
//!   applies the domain gate, moderation and peer bans as hard filters,
//!   then ranks by trust, quality, backend preference, peer reputation and
//!   variant prevalence.
//! - [`SwarmDownloader`] spreads chunks over the sources of the best
//!   variant. Every chunk outcome is reported to the reputation service.
//! - A [`RescuePolicy`] watches per-source progress; slow sources are
//!   retired and their chunks move to faster or standby sources.
//! - [`TransferResolver`] ties both together and re-plans once when every
//!   source has been dropped.
//! - Plan states only move forward; terminal states never change.

mod canonical;
mod domain;
mod error;
mod plan;
mod planner;
mod rescue;
mod resolver;
mod swarm;

pub use canonical::{
    detect_transcode, estimate_quality, is_lossless_codec, select_canonical, AudioVariant,
    CanonicalStats, LibraryHealth, TRANSCODE_BITRATE_RATIO,
};
pub use domain::DomainGate;
pub use error::FetchError;
pub use plan::{PlanStatus, RankedCandidate, TransferPlan, TransferRequest};
pub use planner::{MultiSourcePlanner, PlannerConfig, ScoreWeights};
pub use rescue::{RescueDecision, RescuePolicy, SourceProgress, ThroughputRescue};
pub use resolver::{ResolvedTransfer, TransferResolver};
pub use swarm::{
    assign_weighted, ChunkFetcher, ChunkManifest, ChunkSpec, SwarmConfig, SwarmDownloader,
    SwarmReport, SwarmStatus, DEFAULT_CHUNK_SIZE,
};
