//! Bulk acquisition jobs.
//!
//! A job is a list of wanted items. Creation is append-only: a job id is
//! written once and never replaced. The runner resolves queued items one at
//! a time and persists each item's status as it changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use soulmesh_discovery::{ContentDomain, IndexedFile, MemoryLibraryIndex};
use soulmesh_transfer::{PlanStatus, TransferRequest, TransferResolver};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::Storage;

/// Items accepted in one job.
pub const MAX_JOB_ITEMS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobItemStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemRequest {
    pub item_id: String,
    pub domain: String,
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub recording_id: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub items: Vec<JobItemRequest>,
}

impl CreateJobRequest {
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(Error::InvalidInput("job has no items".into()));
        }
        if self.items.len() > MAX_JOB_ITEMS {
            return Err(Error::InvalidInput(format!(
                "job has {} items, limit is {MAX_JOB_ITEMS}",
                self.items.len()
            )));
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.item_id.trim().is_empty() {
                return Err(Error::InvalidInput(format!("item {i}: item_id is empty")));
            }
            if item.filename.trim().is_empty() {
                return Err(Error::InvalidInput(format!("item {i}: filename is empty")));
            }
            item.domain
                .parse::<ContentDomain>()
                .map_err(|e| Error::InvalidInput(format!("item {i}: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    #[serde(flatten)]
    pub request: JobItemRequest,
    pub status: JobItemStatus,
    pub plan_id: Option<Uuid>,
    pub error: Option<String>,
    pub bytes: Option<u64>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    /// Finished with at least one failed or cancelled item.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub created_at_ms: u64,
    pub items: Vec<JobItem>,
}

impl Job {
    pub fn new(request: CreateJobRequest, created_at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at_ms,
            items: request
                .items
                .into_iter()
                .map(|request| JobItem {
                    request,
                    status: JobItemStatus::Queued,
                    plan_id: None,
                    error: None,
                    bytes: None,
                    output_path: None,
                })
                .collect(),
        }
    }

    pub fn status(&self) -> JobStatus {
        let all = |s: JobItemStatus| self.items.iter().all(|i| i.status == s);
        if all(JobItemStatus::Queued) {
            JobStatus::Queued
        } else if all(JobItemStatus::Completed) {
            JobStatus::Completed
        } else if self.items.iter().all(|i| i.status.is_terminal()) {
            JobStatus::Partial
        } else {
            JobStatus::Running
        }
    }

    pub fn has_pending(&self) -> bool {
        self.items.iter().any(|i| !i.status.is_terminal())
    }
}

/// Handle used to queue jobs for the runner.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Uuid>,
}

impl JobQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Persist and queue a new job.
    pub async fn submit(&self, storage: &Storage, request: CreateJobRequest, now_ms: u64) -> Result<Job> {
        request.validate()?;
        let job = Job::new(request, now_ms);
        storage.create_job(&job)?;
        if self.tx.send(job.id).await.is_err() {
            warn!(job = %job.id, "Job runner is not running; job stays queued");
        }
        info!(job = %job.id, items = job.items.len(), "Job created");
        Ok(job)
    }
}

pub struct JobRunner {
    storage: Arc<Storage>,
    resolver: Arc<TransferResolver>,
    downloads: PathBuf,
    library: Option<Arc<MemoryLibraryIndex>>,
}

fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    match cleaned.trim_matches('.').trim() {
        "" => "download".to_string(),
        s => s.to_string(),
    }
}

impl JobRunner {
    pub fn new(storage: Arc<Storage>, resolver: Arc<TransferResolver>, downloads: PathBuf) -> Self {
        Self {
            storage,
            resolver,
            downloads,
            library: None,
        }
    }

    /// Share completed downloads through this index.
    pub fn with_library(mut self, library: Arc<MemoryLibraryIndex>) -> Self {
        self.library = Some(library);
        self
    }

    /// Re-queue jobs left unfinished by a previous run.
    pub fn recover(&self) -> Result<Vec<Uuid>> {
        let mut pending = Vec::new();
        for mut job in self.storage.list_jobs()? {
            let mut touched = false;
            for item in &mut job.items {
                if item.status == JobItemStatus::Running {
                    item.status = JobItemStatus::Queued;
                    touched = true;
                }
            }
            if touched {
                self.storage.update_job(&job)?;
            }
            if job.has_pending() {
                pending.push(job.id);
            }
        }
        if !pending.is_empty() {
            info!(jobs = pending.len(), "Recovered unfinished jobs");
        }
        Ok(pending)
    }

    pub async fn run(self, queue: JobQueue, mut rx: mpsc::Receiver<Uuid>, cancel: CancellationToken) {
        match self.recover() {
            Ok(ids) => {
                for id in ids {
                    if queue.tx.try_send(id).is_err() {
                        warn!(job = %id, "Job queue full during recovery");
                    }
                }
            }
            Err(e) => error!("Job recovery failed: {}", e),
        }
        drop(queue);

        loop {
            let id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            if let Err(e) = self.run_job(id, &cancel).await {
                error!(job = %id, "Job failed: {}", e);
            }
        }
        debug!("Job runner stopped");
    }

    async fn run_job(&self, id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let mut job = self
            .storage
            .get_job(&id)?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;

        for i in 0..job.items.len() {
            if job.items[i].status != JobItemStatus::Queued {
                continue;
            }
            if cancel.is_cancelled() {
                // Left queued; picked up again by `recover`.
                break;
            }
            job.items[i].status = JobItemStatus::Running;
            self.storage.update_job(&job)?;

            let outcome = self.run_item(&job.items[i].request, cancel).await;
            let item = &mut job.items[i];
            match outcome {
                Ok((plan_id, bytes, path)) => {
                    item.status = JobItemStatus::Completed;
                    item.plan_id = Some(plan_id);
                    item.bytes = Some(bytes);
                    item.output_path = Some(path);
                }
                Err((plan_id, status, message)) => {
                    item.status = status;
                    item.plan_id = plan_id;
                    item.error = Some(message);
                }
            }
            self.storage.update_job(&job)?;
        }
        info!(job = %id, status = ?job.status(), "Job pass finished");
        Ok(())
    }

    async fn run_item(
        &self,
        item: &JobItemRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<(Uuid, u64, String), (Option<Uuid>, JobItemStatus, String)> {
        let mut request = TransferRequest::new(&item.item_id, &item.domain, &item.filename, item.size);
        request.recording_id = item.recording_id.clone();
        request.fingerprint = item.fingerprint.clone();

        let resolved = self.resolver.resolve(&request, None, cancel).await;
        let plan_id = resolved.plan.id;
        match (resolved.plan.status, resolved.data) {
            (PlanStatus::Completed, Some(data)) => {
                let path = self
                    .write_output(&item.item_id, &item.filename, &data)
                    .await
                    .map_err(|e| (Some(plan_id), JobItemStatus::Failed, format!("Write failed: {e}")))?;
                Ok((plan_id, data.len() as u64, path))
            }
            (PlanStatus::Cancelled, _) => Err((Some(plan_id), JobItemStatus::Cancelled, "transfer cancelled".into())),
            (_, _) => {
                let message = resolved
                    .plan
                    .error_message
                    .unwrap_or_else(|| "transfer did not complete".to_string());
                Err((Some(plan_id), JobItemStatus::Failed, message))
            }
        }
    }

    async fn write_output(&self, item_id: &str, filename: &str, data: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.downloads).await?;
        let path = self.downloads.join(format!("{}_{}", sanitize(item_id), sanitize(filename)));
        tokio::fs::write(&path, data).await?;
        let path_str = path_string(&path);
        if let Some(library) = &self.library {
            library.add(IndexedFile::new(item_id, path_str.clone(), data.len() as u64));
        }
        Ok(path_str)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
