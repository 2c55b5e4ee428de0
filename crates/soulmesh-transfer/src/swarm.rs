//! Chunked multi-source swarm transfer.
//!
//! Content is split into fixed-size chunks. Chunks are spread over the top
//! ranked sources in proportion to their plan score; each source has one
//! request outstanding at a time and idle sources steal queued work from
//! busy ones. A failed chunk penalizes its source and moves to the next
//! available source. The rescue policy is consulted on every tick and may
//! retire a slow source, hand its chunks to the others and bring standby
//! sources in.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use soulmesh_discovery::SourceCandidate;
use soulmesh_reputation::{ChunkOutcome, PeerMetricsService};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::FetchError;
use crate::plan::{PlanStatus, RankedCandidate, TransferPlan};
use crate::planner::variant_key;
use crate::rescue::{RescueDecision, RescuePolicy, SourceProgress};

pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
    /// BLAKE3 of the chunk, when the publisher supplied one.
    pub hash: Option<[u8; 32]>,
}

impl ChunkSpec {
    pub fn verify(&self, data: &[u8]) -> bool {
        if data.len() as u64 != self.len {
            return false;
        }
        self.hash
            .map_or(true, |expected| blake3::hash(data).as_bytes() == &expected)
    }
}

/// Size and optional per-chunk hashes of the content being fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub total_len: u64,
    pub chunk_size: u64,
    pub hashes: Option<Vec<[u8; 32]>>,
}

impl ChunkManifest {
    pub fn new(total_len: u64, chunk_size: u64) -> Self {
        Self {
            total_len,
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
            hashes: None,
        }
    }

    /// Manifest with hashes computed from the content itself.
    pub fn from_content(data: &[u8], chunk_size: u64) -> Self {
        let mut manifest = Self::new(data.len() as u64, chunk_size);
        let hashes = data
            .chunks(manifest.chunk_size as usize)
            .map(|c| *blake3::hash(c).as_bytes())
            .collect();
        manifest.hashes = Some(hashes);
        manifest
    }

    pub fn chunks(&self) -> Vec<ChunkSpec> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        while offset < self.total_len {
            let len = self.chunk_size.min(self.total_len - offset);
            let index = out.len();
            let hash = self.hashes.as_ref().and_then(|h| h.get(index).copied());
            out.push(ChunkSpec { index, offset, len, hash });
            offset += len;
        }
        out
    }
}

/// Fetches one chunk from one source.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch_chunk(&self, source: &SourceCandidate, chunk: &ChunkSpec) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub chunk_size: u64,
    /// Sources used at once; the rest stand by.
    pub parallel_sources: usize,
    pub chunk_timeout: Duration,
    /// Failures in a row, across sources, before the transfer fails.
    pub max_consecutive_failures: u32,
    /// Failures in a row before one source is dropped.
    pub max_failures_per_source: u32,
    pub rescue_check_interval: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel_sources: 4,
            chunk_timeout: Duration::from_secs(30),
            max_consecutive_failures: 8,
            max_failures_per_source: 2,
            rescue_check_interval: Duration::from_secs(1),
        }
    }
}

impl SwarmConfig {
    pub fn with_chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_parallel_sources(mut self, n: usize) -> Self {
        self.parallel_sources = n.max(1);
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n.max(1);
        self
    }

    pub fn with_max_failures_per_source(mut self, n: u32) -> Self {
        self.max_failures_per_source = n.max(1);
        self
    }

    pub fn with_rescue_check_interval(mut self, interval: Duration) -> Self {
        self.rescue_check_interval = interval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmStatus {
    Completed,
    Failed(String),
    Cancelled,
    /// Every usable source was dropped before the content was complete.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct SwarmReport {
    pub status: SwarmStatus,
    pub data: Option<Bytes>,
    /// Chunks delivered, by source label.
    pub chunks_by_source: HashMap<String, usize>,
    /// Sources retired by the rescue policy.
    pub rescued_sources: Vec<String>,
    pub failures: u32,
}

impl SwarmReport {
    fn finished(status: SwarmStatus) -> Self {
        Self {
            status,
            data: None,
            chunks_by_source: HashMap::new(),
            rescued_sources: Vec::new(),
            failures: 0,
        }
    }
}

/// Even split of `chunks` in proportion to `weights`, in contiguous runs.
pub fn assign_weighted(chunks: &[usize], weights: &[u64]) -> Vec<VecDeque<usize>> {
    let mut out = vec![VecDeque::new(); weights.len()];
    if weights.is_empty() {
        return out;
    }
    let total = chunks.len() as u64;
    let sum: u64 = weights.iter().sum();
    let mut counts: Vec<u64> = if sum == 0 {
        vec![total / weights.len() as u64; weights.len()]
    } else {
        weights.iter().map(|&w| (w * total) / sum).collect()
    };
    let mut assigned: u64 = counts.iter().sum();
    let mut i = 0usize;
    while assigned < total {
        let n = counts.len();
        counts[i % n] += 1;
        assigned += 1;
        i += 1;
    }
    let mut idx = 0usize;
    for (source, &count) in counts.iter().enumerate() {
        for _ in 0..count {
            if let Some(&chunk) = chunks.get(idx) {
                out[source].push_back(chunk);
                idx += 1;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Active,
    Standby,
    Retired,
}

struct InFlight {
    chunk: usize,
    started: Instant,
    cancel: CancellationToken,
}

struct Source {
    ranked: RankedCandidate,
    label: String,
    state: SourceState,
    queue: VecDeque<usize>,
    in_flight: Option<InFlight>,
    failures: u32,
    bytes: u64,
    first_started: Option<Instant>,
}

impl Source {
    fn load(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}

struct FetchDone {
    source: usize,
    chunk: usize,
    elapsed: Duration,
    result: Result<Bytes, FetchError>,
}

fn source_label(c: &SourceCandidate) -> String {
    match c.peer_id() {
        Some(peer) => peer.to_string(),
        None => format!("{}:{}", c.backend, c.id),
    }
}

pub struct SwarmDownloader {
    fetcher: Arc<dyn ChunkFetcher>,
    metrics: Arc<PeerMetricsService>,
    rescue: Arc<dyn RescuePolicy>,
    config: SwarmConfig,
}

/// Mutable state of one run.
struct Run<'a> {
    downloader: &'a SwarmDownloader,
    chunks: Vec<ChunkSpec>,
    data: Vec<Option<Bytes>>,
    done: usize,
    sources: Vec<Source>,
    orphans: VecDeque<usize>,
    tasks: JoinSet<FetchDone>,
    token: CancellationToken,
    consecutive_failures: u32,
    report: SwarmReport,
}

impl SwarmDownloader {
    pub fn new(
        fetcher: Arc<dyn ChunkFetcher>,
        metrics: Arc<PeerMetricsService>,
        rescue: Arc<dyn RescuePolicy>,
        config: SwarmConfig,
    ) -> Self {
        Self {
            fetcher,
            metrics,
            rescue,
            config,
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Fetch the best variant of a planned item.
    ///
    /// Sources are the plan's candidates that share the top candidate's
    /// variant (recording and size). Without a manifest the size comes
    /// from the top candidate.
    pub async fn download(
        &self,
        plan: &TransferPlan,
        manifest: Option<ChunkManifest>,
        cancel: &CancellationToken,
    ) -> SwarmReport {
        if plan.status != PlanStatus::Planned {
            return SwarmReport::finished(SwarmStatus::Failed(format!(
                "plan is {:?}, not planned",
                plan.status
            )));
        }
        let Some(best) = plan.best() else {
            return SwarmReport::finished(SwarmStatus::Exhausted);
        };
        let target = variant_key(&best.candidate);
        let manifest = match manifest {
            Some(m) => m,
            None => match best.candidate.size_bytes {
                Some(size) => ChunkManifest::new(size, self.config.chunk_size),
                None => {
                    return SwarmReport::finished(SwarmStatus::Failed(
                        "content size unknown".to_string(),
                    ))
                }
            },
        };

        let group: Vec<RankedCandidate> = plan
            .ordered_candidates
            .iter()
            .filter(|r| variant_key(&r.candidate) == target)
            .filter(|r| r.candidate.size_bytes.map_or(true, |s| s == manifest.total_len))
            .cloned()
            .collect();

        let chunks = manifest.chunks();
        if chunks.is_empty() {
            let mut report = SwarmReport::finished(SwarmStatus::Completed);
            report.data = Some(Bytes::new());
            return report;
        }

        let mut run = Run::new(self, chunks, group, cancel.child_token());
        run.execute(cancel).await
    }
}

impl<'a> Run<'a> {
    fn new(
        downloader: &'a SwarmDownloader,
        chunks: Vec<ChunkSpec>,
        group: Vec<RankedCandidate>,
        token: CancellationToken,
    ) -> Self {
        let active = downloader.config.parallel_sources.min(group.len());
        let mut sources: Vec<Source> = group
            .into_iter()
            .enumerate()
            .map(|(i, ranked)| Source {
                label: source_label(&ranked.candidate),
                ranked,
                state: if i < active { SourceState::Active } else { SourceState::Standby },
                queue: VecDeque::new(),
                in_flight: None,
                failures: 0,
                bytes: 0,
                first_started: None,
            })
            .collect();

        let indices: Vec<usize> = (0..chunks.len()).collect();
        let weights: Vec<u64> = sources[..active]
            .iter()
            .map(|s| ((s.ranked.score.max(0.0) * 1000.0) as u64).max(1))
            .collect();
        for (source, queue) in sources.iter_mut().zip(assign_weighted(&indices, &weights)) {
            source.queue = queue;
        }

        let data = vec![None; chunks.len()];
        Self {
            downloader,
            chunks,
            data,
            done: 0,
            sources,
            orphans: VecDeque::new(),
            tasks: JoinSet::new(),
            token,
            consecutive_failures: 0,
            report: SwarmReport::finished(SwarmStatus::Exhausted),
        }
    }

    async fn execute(mut self, cancel: &CancellationToken) -> SwarmReport {
        let mut ticker = tokio::time::interval(self.downloader.config.rescue_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            if self.done == self.chunks.len() {
                break SwarmStatus::Completed;
            }
            if self.consecutive_failures >= self.downloader.config.max_consecutive_failures {
                break SwarmStatus::Failed(format!(
                    "{} consecutive chunk failures",
                    self.consecutive_failures
                ));
            }
            self.dispatch();
            if self.tasks.is_empty() {
                break SwarmStatus::Exhausted;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SwarmStatus::Cancelled,
                joined = self.tasks.join_next() => {
                    if let Some(Ok(done)) = joined {
                        self.handle(done);
                    }
                }
                _ = ticker.tick() => self.check_rescue(),
            }
        };

        self.token.cancel();
        self.tasks.shutdown().await;

        match &status {
            SwarmStatus::Completed => {
                let total: usize = self.chunks.iter().map(|c| c.len as usize).sum();
                let mut out = BytesMut::with_capacity(total);
                for chunk in self.data.iter().flatten() {
                    out.extend_from_slice(chunk);
                }
                self.report.data = Some(out.freeze());
                info!(chunks = self.chunks.len(), bytes = total, "Swarm transfer complete");
            }
            SwarmStatus::Cancelled => info!(done = self.done, "Swarm transfer cancelled"),
            SwarmStatus::Failed(reason) => warn!(done = self.done, %reason, "Swarm transfer failed"),
            SwarmStatus::Exhausted => warn!(done = self.done, "Swarm sources exhausted"),
        }
        self.report.status = status;
        self.report
    }

    /// Next chunk for idle source `s`: orphans, own queue, then stolen.
    fn next_chunk_for(&mut self, s: usize) -> Option<usize> {
        while let Some(c) = self.orphans.pop_front() {
            if self.data[c].is_none() {
                return Some(c);
            }
        }
        while let Some(c) = self.sources[s].queue.pop_front() {
            if self.data[c].is_none() {
                return Some(c);
            }
        }
        let victim = self
            .sources
            .iter()
            .enumerate()
            .filter(|(i, src)| *i != s && src.state == SourceState::Active && !src.queue.is_empty())
            .max_by_key(|(_, src)| src.queue.len())
            .map(|(i, _)| i)?;
        self.sources[victim].queue.pop_back()
    }

    fn dispatch(&mut self) {
        for s in 0..self.sources.len() {
            if self.sources[s].state != SourceState::Active || self.sources[s].in_flight.is_some() {
                continue;
            }
            let Some(chunk) = self.next_chunk_for(s) else {
                continue;
            };
            self.spawn_fetch(s, chunk);
        }
    }

    fn spawn_fetch(&mut self, s: usize, chunk: usize) {
        let fetcher = Arc::clone(&self.downloader.fetcher);
        let candidate = self.sources[s].ranked.candidate.clone();
        let range = self.chunks[chunk].clone();
        let cancel = self.token.child_token();
        let timeout = self.downloader.config.chunk_timeout;
        let now = Instant::now();

        let source = &mut self.sources[s];
        source.first_started.get_or_insert(now);
        source.in_flight = Some(InFlight {
            chunk,
            started: now,
            cancel: cancel.clone(),
        });
        trace!(source = %source.label, chunk, "Chunk requested");

        self.tasks.spawn(async move {
            let fetch = AssertUnwindSafe(tokio::time::timeout(timeout, fetcher.fetch_chunk(&candidate, &range)))
                .catch_unwind();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                r = fetch => match r {
                    Ok(Ok(inner)) => inner,
                    Ok(Err(_elapsed)) => Err(FetchError::Timeout),
                    Err(_panic) => Err(FetchError::Failed("chunk fetcher panicked".to_string())),
                },
            };
            FetchDone {
                source: s,
                chunk,
                elapsed: now.elapsed(),
                result,
            }
        });
    }

    fn record(&self, s: usize, outcome: ChunkOutcome, bytes: u64, elapsed: Duration) {
        if let Some(peer) = self.sources[s].ranked.candidate.peer_id() {
            let rtt_ms = elapsed.as_secs_f64() * 1000.0;
            self.downloader
                .metrics
                .record_chunk_result(peer, outcome, rtt_ms, bytes, elapsed);
        }
    }

    fn handle(&mut self, done: FetchDone) {
        let current = matches!(&self.sources[done.source].in_flight, Some(f) if f.chunk == done.chunk);
        if current {
            self.sources[done.source].in_flight = None;
        }

        let outcome = match done.result {
            Err(FetchError::Cancelled) => return,
            Err(_) if !current => return,
            Ok(bytes) if self.chunks[done.chunk].verify(&bytes) => {
                self.record(done.source, ChunkOutcome::Completed, bytes.len() as u64, done.elapsed);
                let source = &mut self.sources[done.source];
                source.failures = 0;
                source.bytes += bytes.len() as u64;
                self.consecutive_failures = 0;
                if self.data[done.chunk].is_none() {
                    self.data[done.chunk] = Some(bytes);
                    self.done += 1;
                    *self
                        .report
                        .chunks_by_source
                        .entry(self.sources[done.source].label.clone())
                        .or_default() += 1;
                }
                return;
            }
            Ok(_) => ChunkOutcome::Corrupted,
            Err(FetchError::Timeout) => ChunkOutcome::TimedOut,
            Err(_) => ChunkOutcome::Failed,
        };

        debug!(source = %self.sources[done.source].label, chunk = done.chunk, ?outcome, "Chunk attempt failed");
        self.record(done.source, outcome, 0, done.elapsed);
        self.consecutive_failures += 1;
        self.report.failures += 1;

        let source = &mut self.sources[done.source];
        source.failures += 1;
        if source.failures >= self.downloader.config.max_failures_per_source
            && source.state == SourceState::Active
        {
            warn!(source = %source.label, failures = source.failures, "Dropping failing source");
            self.retire(done.source);
        }
        if self.data[done.chunk].is_none() {
            self.requeue(done.chunk, done.source);
        }
    }

    /// Stop using `s` and move its queued chunks elsewhere.
    fn retire(&mut self, s: usize) {
        self.sources[s].state = SourceState::Retired;
        let queued: Vec<usize> = self.sources[s].queue.drain(..).collect();
        for chunk in queued {
            self.requeue(chunk, s);
        }
    }

    fn promote_standby(&mut self) -> Option<usize> {
        let s = self
            .sources
            .iter()
            .position(|src| src.state == SourceState::Standby)?;
        info!(source = %self.sources[s].label, "Bringing standby source into the swarm");
        self.sources[s].state = SourceState::Active;
        Some(s)
    }

    /// Give `chunk` to the least-loaded active source other than `from`,
    /// a standby source, `from` itself if still active, or the orphan list.
    fn requeue(&mut self, chunk: usize, from: usize) {
        let target = self
            .sources
            .iter()
            .enumerate()
            .filter(|(i, src)| *i != from && src.state == SourceState::Active)
            .min_by_key(|(i, src)| (src.load(), *i))
            .map(|(i, _)| i)
            .or_else(|| self.promote_standby())
            .or_else(|| (self.sources[from].state == SourceState::Active).then_some(from));
        match target {
            Some(t) => self.sources[t].queue.push_back(chunk),
            None => self.orphans.push_back(chunk),
        }
    }

    fn check_rescue(&mut self) {
        let now = Instant::now();
        for s in 0..self.sources.len() {
            if self.sources[s].state != SourceState::Active {
                continue;
            }
            let has_alternative = self
                .sources
                .iter()
                .enumerate()
                .any(|(i, src)| i != s && src.state != SourceState::Retired);
            if !has_alternative {
                continue;
            }

            let source = &self.sources[s];
            let Some(first_started) = source.first_started else {
                continue;
            };
            let progress = SourceProgress {
                source: source.label.clone(),
                in_flight_for: source.in_flight.as_ref().map(|f| now - f.started),
                active_for: now - first_started,
                bytes_received: source.bytes,
                chunks_remaining: source.load(),
            };

            let RescueDecision::Rescue { reason, extra_sources } = self.downloader.rescue.evaluate(&progress) else {
                continue;
            };
            warn!(source = %progress.source, %reason, remaining = progress.chunks_remaining, "Rescuing transfer from slow source");

            for _ in 0..extra_sources {
                if self.promote_standby().is_none() {
                    break;
                }
            }
            if let Some(stalled) = self.sources[s].in_flight.take() {
                stalled.cancel.cancel();
                self.record(s, ChunkOutcome::TimedOut, 0, now - stalled.started);
                self.sources[s].state = SourceState::Retired;
                if self.data[stalled.chunk].is_none() {
                    self.requeue(stalled.chunk, s);
                }
            }
            self.retire(s);
            self.report.rescued_sources.push(progress.source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rescue::ThroughputRescue;
    use soulmesh_discovery::BackendRef;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const CONTENT_LEN: usize = 10 * 64;

    fn content() -> Vec<u8> {
        (0..CONTENT_LEN).map(|i| (i % 251) as u8).collect()
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Good,
        /// Serve this many chunks, then hang.
        StallAfter(usize),
        Corrupt,
        Down,
    }

    struct FakeFetcher {
        content: Vec<u8>,
        behaviour: HashMap<String, Behaviour>,
        served: Mutex<HashMap<String, usize>>,
    }

    impl FakeFetcher {
        fn new(behaviour: &[(&str, Behaviour)]) -> Self {
            Self {
                content: content(),
                behaviour: behaviour.iter().map(|(p, b)| (p.to_string(), *b)).collect(),
                served: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl ChunkFetcher for FakeFetcher {
        async fn fetch_chunk(&self, source: &SourceCandidate, chunk: &ChunkSpec) -> Result<Bytes, FetchError> {
            let peer = source.peer_id().unwrap_or_default().to_string();
            let served = {
                let mut map = self.served.lock().unwrap();
                let n = map.entry(peer.clone()).or_default();
                *n += 1;
                *n
            };
            tokio::time::sleep(Duration::from_millis(50)).await;
            let range = chunk.offset as usize..(chunk.offset + chunk.len) as usize;
            match self.behaviour.get(&peer).copied().unwrap_or(Behaviour::Good) {
                Behaviour::Good => Ok(Bytes::copy_from_slice(&self.content[range])),
                Behaviour::StallAfter(n) if served > n => std::future::pending().await,
                Behaviour::StallAfter(_) => Ok(Bytes::copy_from_slice(&self.content[range])),
                Behaviour::Corrupt => Ok(Bytes::from(vec![0xff; chunk.len as usize])),
                Behaviour::Down => Err(FetchError::Unavailable("connection refused".into())),
            }
        }
    }

    fn planned(peers: &[&str]) -> TransferPlan {
        let mut plan = TransferPlan::new("x");
        let ranked = peers
            .iter()
            .enumerate()
            .map(|(i, p)| RankedCandidate {
                candidate: SourceCandidate::new(
                    "x",
                    BackendRef::MeshPeer { peer_id: p.to_string(), filename: "x.flac".into() },
                    0,
                )
                .with_recording("rec")
                .with_size(CONTENT_LEN as u64),
                score: 1.0 - i as f64 * 0.1,
            })
            .collect();
        plan.mark_planned(ranked);
        plan
    }

    fn downloader(fetcher: FakeFetcher, metrics: Arc<PeerMetricsService>, config: SwarmConfig) -> SwarmDownloader {
        let rescue = ThroughputRescue::default()
            .with_stall_after(Duration::from_secs(2))
            .with_grace(Duration::from_secs(3600));
        SwarmDownloader::new(Arc::new(fetcher), metrics, Arc::new(rescue), config)
    }

    fn config() -> SwarmConfig {
        SwarmConfig::default()
            .with_chunk_size(64)
            .with_chunk_timeout(Duration::from_secs(5))
    }

    #[test]
    fn weighted_assignment_covers_every_chunk() {
        let chunks: Vec<usize> = (0..10).collect();
        let queues = assign_weighted(&chunks, &[3, 1, 1]);
        assert_eq!(queues.iter().map(VecDeque::len).collect::<Vec<_>>(), vec![6, 2, 2]);
        let all: HashSet<usize> = queues.iter().flatten().copied().collect();
        assert_eq!(all.len(), 10);
        assert!(assign_weighted(&chunks, &[]).is_empty());
        assert_eq!(assign_weighted(&chunks, &[0, 0]).iter().map(VecDeque::len).sum::<usize>(), 10);
    }

    #[test]
    fn manifest_chunks_and_hashes() {
        let data = content();
        let manifest = ChunkManifest::from_content(&data, 64);
        let chunks = manifest.chunks();
        assert_eq!(chunks.len(), 10);
        assert!(chunks[3].verify(&data[192..256]));
        assert!(!chunks[3].verify(&data[0..64]));
        assert!(!chunks[3].verify(&data[192..200]));

        let odd = ChunkManifest::new(130, 64).chunks();
        assert_eq!(odd.iter().map(|c| c.len).collect::<Vec<_>>(), vec![64, 64, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_from_all_sources() {
        let metrics = Arc::new(PeerMetricsService::default());
        let d = downloader(FakeFetcher::new(&[]), Arc::clone(&metrics), config());
        let report = d.download(&planned(&["b", "c"]), None, &CancellationToken::new()).await;
        assert_eq!(report.status, SwarmStatus::Completed);
        assert_eq!(report.data.unwrap().as_ref(), content().as_slice());
        assert!(report.chunks_by_source["b"] > 0);
        assert!(report.chunks_by_source["c"] > 0);
        assert!(metrics.get_metrics("b").unwrap().chunks_completed > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_source_is_rescued() {
        let metrics = Arc::new(PeerMetricsService::default());
        let fetcher = FakeFetcher::new(&[("b", Behaviour::StallAfter(1))]);
        let d = downloader(fetcher, Arc::clone(&metrics), config());
        let report = d.download(&planned(&["b", "c"]), None, &CancellationToken::new()).await;

        assert_eq!(report.status, SwarmStatus::Completed);
        assert_eq!(report.data.unwrap().as_ref(), content().as_slice());
        assert_eq!(report.rescued_sources, vec!["b".to_string()]);
        assert_eq!(report.chunks_by_source["b"], 1);
        assert_eq!(report.chunks_by_source["c"], 9);
        assert_eq!(metrics.get_metrics("b").unwrap().chunks_timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_chunks_are_reassigned() {
        let metrics = Arc::new(PeerMetricsService::default());
        let d = downloader(FakeFetcher::new(&[("b", Behaviour::Corrupt)]), Arc::clone(&metrics), config());
        let manifest = ChunkManifest::from_content(&content(), 64);
        let report = d
            .download(&planned(&["b", "c"]), Some(manifest), &CancellationToken::new())
            .await;
        assert_eq!(report.status, SwarmStatus::Completed);
        assert_eq!(report.data.unwrap().as_ref(), content().as_slice());
        assert!(!report.chunks_by_source.contains_key("b"));
        let b = metrics.get_metrics("b").unwrap();
        assert_eq!(b.chunks_corrupted, 2);
        assert_eq!(b.chunks_completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn standby_source_replaces_dead_one() {
        let metrics = Arc::new(PeerMetricsService::default());
        let d = downloader(
            FakeFetcher::new(&[("b", Behaviour::Down)]),
            metrics,
            config().with_parallel_sources(1),
        );
        let report = d.download(&planned(&["b", "c"]), None, &CancellationToken::new()).await;
        assert_eq!(report.status, SwarmStatus::Completed);
        assert_eq!(report.chunks_by_source["c"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn all_sources_failing_ends_the_run() {
        let metrics = Arc::new(PeerMetricsService::default());
        let d = downloader(
            FakeFetcher::new(&[("b", Behaviour::Down), ("c", Behaviour::Down)]),
            metrics,
            config(),
        );
        let report = d.download(&planned(&["b", "c"]), None, &CancellationToken::new()).await;
        assert!(matches!(report.status, SwarmStatus::Exhausted | SwarmStatus::Failed(_)));
        assert!(report.data.is_none());

        let d = downloader(
            FakeFetcher::new(&[("b", Behaviour::Down)]),
            Arc::new(PeerMetricsService::default()),
            config().with_max_failures_per_source(100).with_max_consecutive_failures(3),
        );
        let report = d.download(&planned(&["b"]), None, &CancellationToken::new()).await;
        assert_eq!(report.status, SwarmStatus::Failed("3 consecutive chunk failures".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_in_flight_fetches() {
        let metrics = Arc::new(PeerMetricsService::default());
        let fetcher = FakeFetcher::new(&[("b", Behaviour::StallAfter(0))]);
        let d = downloader(fetcher, metrics, config());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let report = d.download(&planned(&["b"]), None, &cancel).await;
        assert_eq!(report.status, SwarmStatus::Cancelled);
    }

    #[tokio::test]
    async fn unplanned_plan_is_rejected() {
        let d = downloader(FakeFetcher::new(&[]), Arc::new(PeerMetricsService::default()), config());
        let report = d.download(&TransferPlan::new("x"), None, &CancellationToken::new()).await;
        assert!(matches!(report.status, SwarmStatus::Failed(_)));
    }
}
