//! Persistent storage using sled.
//!
//! One database, one tree per record family:
//!
//! | tree           | key                        | value                     |
//! |----------------|----------------------------|---------------------------|
//! | `identity`     | `secret`                   | 32-byte Ed25519 secret    |
//! | `peer_metrics` | peer id                    | bincode metrics           |
//! | `peer_bans`    | peer id                    | reason (utf-8)            |
//! | `variants`     | recording id, 0, variant id | bincode `AudioVariant`   |
//! | `jobs`         | job uuid bytes             | JSON `Job`                |

use std::collections::BTreeMap;
use std::path::Path;

use soulmesh_identity::PeerIdentity;
use soulmesh_reputation::{MetricsStore, PeerPerformanceMetrics};
use soulmesh_transfer::{AudioVariant, CanonicalStats, LibraryHealth};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::jobs::Job;

const IDENTITY_TREE: &str = "identity";
const METRICS_TREE: &str = "peer_metrics";
const BANS_TREE: &str = "peer_bans";
const VARIANTS_TREE: &str = "variants";
const JOBS_TREE: &str = "jobs";

const SECRET_KEY: &[u8] = b"secret";

/// Storage backend for node state.
pub struct Storage {
    db: sled::Db,
    identity: sled::Tree,
    metrics: sled::Tree,
    bans: sled::Tree,
    variants: sled::Tree,
    jobs: sled::Tree,
}

fn variant_key(recording_id: &str, variant_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(recording_id.len() + variant_id.len() + 1);
    key.extend_from_slice(recording_id.as_bytes());
    key.push(0);
    key.extend_from_slice(variant_id.as_bytes());
    key
}

fn recording_prefix(recording_id: &str) -> Vec<u8> {
    let mut prefix = recording_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            identity: db.open_tree(IDENTITY_TREE)?,
            metrics: db.open_tree(METRICS_TREE)?,
            bans: db.open_tree(BANS_TREE)?,
            variants: db.open_tree(VARIANTS_TREE)?,
            jobs: db.open_tree(JOBS_TREE)?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // --- Identity ---

    /// The node's identity: loaded if present, generated and stored otherwise.
    pub fn load_or_create_identity(&self) -> Result<PeerIdentity> {
        if let Some(secret) = self.identity.get(SECRET_KEY)? {
            return Ok(PeerIdentity::from_secret_bytes(&secret)?);
        }
        let identity = PeerIdentity::generate();
        let stored = self.identity.compare_and_swap(
            SECRET_KEY,
            None as Option<&[u8]>,
            Some(identity.secret_bytes().to_vec()),
        )?;
        if stored.is_err() {
            // Another opener won the race; use its key.
            return self.load_or_create_identity();
        }
        self.identity.flush()?;
        info!(peer_id = %identity.peer_id(), "Generated new node identity");
        Ok(identity)
    }

    /// Replace the stored identity. Operator action only.
    pub fn rotate_identity(&self) -> Result<PeerIdentity> {
        let identity = PeerIdentity::generate();
        self.identity
            .insert(SECRET_KEY, identity.secret_bytes().to_vec())?;
        self.identity.flush()?;
        warn!(peer_id = %identity.peer_id(), "Node identity rotated");
        Ok(identity)
    }

    // --- Variant catalog ---

    /// Record an observation of a variant. Repeat observations add to
    /// `seen_count`; the first record's format fields are kept.
    pub fn record_variant(&self, variant: &AudioVariant) -> Result<AudioVariant> {
        if variant.recording_id.is_empty() || variant.variant_id.is_empty() {
            return Err(Error::InvalidInput("variant needs recording_id and variant_id".into()));
        }
        let key = variant_key(&variant.recording_id, &variant.variant_id);
        loop {
            let current = self.variants.get(&key)?;
            let merged = match &current {
                Some(bytes) => {
                    let mut existing: AudioVariant = bincode::deserialize(bytes)?;
                    existing.seen_count = existing.seen_count.saturating_add(variant.seen_count.max(1));
                    existing
                }
                None => variant.clone(),
            };
            let encoded = bincode::serialize(&merged)?;
            if self.variants.compare_and_swap(&key, current, Some(encoded))?.is_ok() {
                return Ok(merged);
            }
        }
    }

    pub fn variants_for(&self, recording_id: &str) -> Result<Vec<AudioVariant>> {
        self.variants
            .scan_prefix(recording_prefix(recording_id))
            .map(|entry| {
                let (_, value) = entry?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    /// Every recording with its variants.
    pub fn recordings(&self) -> Result<BTreeMap<String, Vec<AudioVariant>>> {
        let mut out: BTreeMap<String, Vec<AudioVariant>> = BTreeMap::new();
        for entry in self.variants.iter() {
            let (_, value) = entry?;
            let variant: AudioVariant = bincode::deserialize(&value)?;
            out.entry(variant.recording_id.clone()).or_default().push(variant);
        }
        Ok(out)
    }

    /// `None` when nothing is known about the recording.
    pub fn canonical_stats(&self, recording_id: &str) -> Result<Option<CanonicalStats>> {
        let variants = self.variants_for(recording_id)?;
        if variants.is_empty() {
            return Ok(None);
        }
        Ok(Some(CanonicalStats::compute(recording_id, &variants)))
    }

    pub fn library_health(&self) -> Result<LibraryHealth> {
        let recordings = self.recordings()?;
        Ok(LibraryHealth::summarize(recordings.values().map(Vec::as_slice)))
    }

    // --- Jobs ---

    /// Store a new job. Fails if the id is already taken.
    pub fn create_job(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_vec(job)?;
        let created = self
            .jobs
            .compare_and_swap(job.id.as_bytes(), None as Option<&[u8]>, Some(value))?;
        if created.is_err() {
            return Err(Error::InvalidInput(format!("job {} already exists", job.id)));
        }
        Ok(())
    }

    /// Write progress for an existing job.
    pub fn update_job(&self, job: &Job) -> Result<()> {
        if !self.jobs.contains_key(job.id.as_bytes())? {
            return Err(Error::NotFound(format!("job {}", job.id)));
        }
        self.jobs.insert(job.id.as_bytes(), serde_json::to_vec(job)?)?;
        Ok(())
    }

    pub fn get_job(&self, id: &Uuid) -> Result<Option<Job>> {
        match self.jobs.get(id.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.iter() {
            let (_, value) = entry?;
            jobs.push(serde_json::from_slice(&value)?);
        }
        Ok(jobs)
    }
}

fn store_err(e: impl std::fmt::Display) -> soulmesh_reputation::Error {
    soulmesh_reputation::Error::Store(e.to_string())
}

impl MetricsStore for Storage {
    fn load_metrics(&self) -> soulmesh_reputation::Result<Vec<PeerPerformanceMetrics>> {
        let mut out = Vec::new();
        for entry in self.metrics.iter() {
            let (key, value) = entry.map_err(store_err)?;
            match bincode::deserialize(&value) {
                Ok(m) => out.push(m),
                Err(e) => warn!(peer = %String::from_utf8_lossy(&key), "Skipping unreadable metrics: {}", e),
            }
        }
        Ok(out)
    }

    fn save_metrics(&self, metrics: &PeerPerformanceMetrics) -> soulmesh_reputation::Result<()> {
        let value = bincode::serialize(metrics).map_err(store_err)?;
        self.metrics
            .insert(metrics.peer_id.as_bytes(), value)
            .map_err(store_err)?;
        Ok(())
    }

    fn load_bans(&self) -> soulmesh_reputation::Result<Vec<(String, String)>> {
        self.bans
            .iter()
            .map(|entry| {
                let (key, value) = entry.map_err(store_err)?;
                Ok((
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ))
            })
            .collect()
    }

    fn save_ban(&self, peer_id: &str, reason: &str) -> soulmesh_reputation::Result<()> {
        self.bans
            .insert(peer_id.as_bytes(), reason.as_bytes())
            .map_err(store_err)?;
        Ok(())
    }

    fn remove_ban(&self, peer_id: &str) -> soulmesh_reputation::Result<()> {
        self.bans.remove(peer_id.as_bytes()).map_err(store_err)?;
        Ok(())
    }
}
