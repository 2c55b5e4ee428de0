//! Node configuration.
//!
//! Layered: built-in defaults, then the first config file found
//! (`$SOULMESH_CONFIG`, `~/.config/soulmesh/config.toml`,
//! `/etc/soulmesh/config.toml`), then `SOULMESH_*` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soulmesh_dht::{PublisherConfig, DEFAULT_MAX_ENTRIES};
use soulmesh_gossip::GossipConfig;
use soulmesh_overlay::{RegistryLimits, SessionConfig};
use soulmesh_reputation::{DecayConfig, ReputationConfig};
use soulmesh_transfer::{PlannerConfig, SwarmConfig, ThroughputRescue};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mesh::MAX_CHUNK_LEN;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Overlay (P2P) listen address.
    pub listen_addr: SocketAddr,
    /// Control API listen address.
    pub api_addr: SocketAddr,
    /// Addresses advertised in this node's DHT descriptor.
    pub advertise: Vec<String>,
    pub seeds: Vec<SocketAddr>,
    /// Legacy-network username, sent in handshakes.
    pub username: String,
    /// Directory shared with the mesh.
    pub shared_dir: Option<PathBuf>,
    pub overlay: OverlaySection,
    pub gossip: GossipSection,
    pub dht: DhtSection,
    pub transfer: TransferSection,
    pub reputation: ReputationSection,
    pub moderation: ModerationSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./soulmesh-data"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7447)),
            api_addr: SocketAddr::from(([127, 0, 0, 1], 7448)),
            advertise: Vec::new(),
            seeds: Vec::new(),
            username: String::new(),
            shared_dir: None,
            overlay: OverlaySection::default(),
            gossip: GossipSection::default(),
            dht: DhtSection::default(),
            transfer: TransferSection::default(),
            reputation: ReputationSection::default(),
            moderation: ModerationSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlaySection {
    pub min_neighbors: usize,
    pub max_neighbors: usize,
    pub max_per_address: usize,
    pub request_timeout_secs: u64,
    /// Refuse handshakes whose claimed peer id is not derived from the presented key.
    pub require_peer_id_binding: bool,
}

impl Default for OverlaySection {
    fn default() -> Self {
        let limits = RegistryLimits::default();
        Self {
            min_neighbors: limits.min_neighbors,
            max_neighbors: limits.max_neighbors,
            max_per_address: limits.max_per_address,
            request_timeout_secs: 15,
            require_peer_id_binding: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GossipSection {
    pub realms: Vec<String>,
    pub max_hops: u32,
    pub subscriber_queue: usize,
}

impl Default for GossipSection {
    fn default() -> Self {
        let gossip = GossipConfig::default();
        Self {
            realms: gossip.realms,
            max_hops: gossip.max_hops,
            subscriber_queue: gossip.subscriber_queue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DhtSection {
    pub refresh_interval_secs: u64,
    pub op_timeout_secs: u64,
    pub replication: usize,
    /// Records held for other peers.
    pub max_records: usize,
}

impl Default for DhtSection {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30 * 60,
            op_timeout_secs: 10,
            replication: 3,
            max_records: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferSection {
    pub prefer_mesh: bool,
    pub parallel_sources: usize,
    pub chunk_size: u64,
    pub chunk_timeout_secs: u64,
    pub stall_after_secs: u64,
    pub min_bytes_per_sec: f64,
    pub max_replans: u32,
}

impl Default for TransferSection {
    fn default() -> Self {
        let swarm = SwarmConfig::default();
        let rescue = ThroughputRescue::default();
        Self {
            prefer_mesh: true,
            parallel_sources: swarm.parallel_sources,
            chunk_size: swarm.chunk_size,
            chunk_timeout_secs: swarm.chunk_timeout.as_secs(),
            stall_after_secs: rescue.stall_after.as_secs(),
            min_bytes_per_sec: rescue.min_bytes_per_sec,
            max_replans: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReputationSection {
    pub decay_rate: f64,
    pub decay_interval_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for ReputationSection {
    fn default() -> Self {
        let decay = DecayConfig::default();
        Self {
            decay_rate: decay.rate,
            decay_interval_secs: decay.interval.as_secs(),
            maintenance_interval_secs: 5 * 60,
        }
    }
}

/// Moderation verdicts are owned by an external policy system. Without
/// one, only the items listed here are offered or fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModerationSection {
    /// Treat every item as allowed. For private meshes only.
    pub allow_all: bool,
    pub allowed_items: Vec<String>,
}

impl NodeConfig {
    /// Defaults, then the first config file found, then the environment.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_file() {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        let mut paths = Vec::new();
        if let Some(explicit) = std::env::var_os("SOULMESH_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".config/soulmesh/config.toml"));
        }
        paths.push(PathBuf::from("/etc/soulmesh/config.toml"));
        paths.into_iter().find(|p| p.exists())
    }

    /// Apply `SOULMESH_*` overrides read through `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key}: cannot parse {value:?}")))
        }
        fn list(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        }

        if let Some(v) = var("SOULMESH_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SOULMESH_LISTEN_ADDR") {
            self.listen_addr = parse("SOULMESH_LISTEN_ADDR", &v)?;
        }
        if let Some(v) = var("SOULMESH_API_ADDR") {
            self.api_addr = parse("SOULMESH_API_ADDR", &v)?;
        }
        if let Some(v) = var("SOULMESH_ADVERTISE") {
            self.advertise = list(&v);
        }
        if let Some(v) = var("SOULMESH_SEEDS") {
            self.seeds = list(&v)
                .iter()
                .map(|s| parse("SOULMESH_SEEDS", s))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = var("SOULMESH_USERNAME") {
            self.username = v;
        }
        if let Some(v) = var("SOULMESH_SHARED_DIR") {
            self.shared_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("SOULMESH_REALMS") {
            self.gossip.realms = list(&v);
        }
        if let Some(v) = var("SOULMESH_PREFER_MESH") {
            self.transfer.prefer_mesh = parse("SOULMESH_PREFER_MESH", &v)?;
        }
        if let Some(v) = var("SOULMESH_ALLOW_ALL") {
            self.moderation.allow_all = parse("SOULMESH_ALLOW_ALL", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let o = &self.overlay;
        if o.max_neighbors == 0 || o.min_neighbors > o.max_neighbors {
            return Err(Error::Config(format!(
                "overlay neighbors: min {} must not exceed max {} (max > 0)",
                o.min_neighbors, o.max_neighbors
            )));
        }
        if o.max_per_address == 0 {
            return Err(Error::Config("overlay.max_per_address must be at least 1".into()));
        }
        let periods = [
            ("overlay.request_timeout_secs", o.request_timeout_secs),
            ("dht.refresh_interval_secs", self.dht.refresh_interval_secs),
            ("dht.op_timeout_secs", self.dht.op_timeout_secs),
            ("transfer.chunk_timeout_secs", self.transfer.chunk_timeout_secs),
            ("reputation.decay_interval_secs", self.reputation.decay_interval_secs),
            ("reputation.maintenance_interval_secs", self.reputation.maintenance_interval_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }
        if self.dht.max_records == 0 {
            return Err(Error::Config("dht.max_records must be at least 1".into()));
        }
        if self.gossip.max_hops == 0 {
            return Err(Error::Config("gossip.max_hops must be at least 1".into()));
        }
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_LEN {
            return Err(Error::Config(format!(
                "transfer.chunk_size must be between 1 and {MAX_CHUNK_LEN}"
            )));
        }
        Ok(())
    }

    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits::default()
            .with_min_neighbors(self.overlay.min_neighbors)
            .with_max_neighbors(self.overlay.max_neighbors)
            .with_max_per_address(self.overlay.max_per_address)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_username(self.username.clone())
            .with_request_timeout(Duration::from_secs(self.overlay.request_timeout_secs))
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig::default()
            .with_realms(self.gossip.realms.clone())
            .with_max_hops(self.gossip.max_hops)
            .with_subscriber_queue(self.gossip.subscriber_queue)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig::default()
            .with_seeds(self.seeds.clone())
            .with_addresses(self.advertise.clone())
            .with_refresh_interval(Duration::from_secs(self.dht.refresh_interval_secs))
            .with_op_timeout(Duration::from_secs(self.dht.op_timeout_secs))
    }

    pub fn reputation_config(&self) -> ReputationConfig {
        ReputationConfig::default().with_decay(DecayConfig::new(
            self.reputation.decay_rate,
            Duration::from_secs(self.reputation.decay_interval_secs),
        ))
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig::default().with_prefer_mesh(self.transfer.prefer_mesh)
    }

    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig::default()
            .with_chunk_size(self.transfer.chunk_size)
            .with_parallel_sources(self.transfer.parallel_sources)
            .with_chunk_timeout(Duration::from_secs(self.transfer.chunk_timeout_secs))
    }

    pub fn rescue_policy(&self) -> ThroughputRescue {
        ThroughputRescue::default()
            .with_stall_after(Duration::from_secs(self.transfer.stall_after_secs))
            .with_min_bytes_per_sec(self.transfer.min_bytes_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.overlay.max_neighbors, 10);
        assert_eq!(config.overlay.max_per_address, 3);
        assert_eq!(config.dht.refresh_interval_secs, 1800);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
username = "alice"
seeds = ["127.0.0.1:9000"]

[transfer]
prefer_mesh = false

[moderation]
allowed_items = ["item-1"]
"#,
        )
        .unwrap();
        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.username, "alice");
        assert_eq!(config.seeds.len(), 1);
        assert!(!config.transfer.prefer_mesh);
        assert_eq!(config.transfer.parallel_sources, 4);
        assert_eq!(config.moderation.allowed_items, vec!["item-1".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "usernme = \"typo\"\n").unwrap();
        assert!(matches!(NodeConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("SOULMESH_SEEDS", "10.0.0.1:7447, 10.0.0.2:7447"),
            ("SOULMESH_REALMS", "music,books"),
            ("SOULMESH_PREFER_MESH", "false"),
        ]
        .into_iter()
        .collect();
        let mut config = NodeConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.gossip.realms, vec!["music", "books"]);
        assert!(!config.transfer.prefer_mesh);

        let mut config = NodeConfig::default();
        let bad = config.apply_overrides(|k| (k == "SOULMESH_API_ADDR").then(|| "nowhere".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn zero_periods_are_rejected() {
        let cases: [fn(&mut NodeConfig); 4] = [
            |c: &mut NodeConfig| c.reputation.maintenance_interval_secs = 0,
            |c: &mut NodeConfig| c.dht.refresh_interval_secs = 0,
            |c: &mut NodeConfig| c.overlay.request_timeout_secs = 0,
            |c: &mut NodeConfig| c.dht.max_records = 0,
        ];
        for zero in cases {
            let mut config = NodeConfig::default();
            zero(&mut config);
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("at least 1"), "{err}");
        }
    }

    #[test]
    fn peer_id_binding_is_on_unless_disabled() {
        assert!(NodeConfig::default().overlay.require_peer_id_binding);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[overlay]\nrequire_peer_id_binding = false\n").unwrap();
        assert!(!NodeConfig::from_file(&path).unwrap().overlay.require_peer_id_binding);
    }

    #[test]
    fn inverted_neighbor_bounds_rejected() {
        let mut config = NodeConfig::default();
        config.overlay.min_neighbors = 11;
        assert!(config.validate().is_err());
    }
}
