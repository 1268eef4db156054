//! Durable job and worker records.
//!
//! Everything that mutates a job or a worker goes through a [`RecordStore`]. Writers are
//! serialized inside the store. [`JsonFileStore`] keeps one pretty-printed JSON file per
//! record so out-of-process tools (the CLI) can read and flag jobs while the daemon runs.

use crate::jobs::{Job, JobId, JobLog, JobStatus, WorkerId};
use crate::workers::Worker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

/// Mutation applied to a stored job. `updated_at` is already bumped when it runs.
pub type JobUpdate<'a> = &'a mut (dyn FnMut(&mut Job) + Send);
pub type WorkerUpdate<'a> = &'a mut (dyn FnMut(&mut Worker) + Send);

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
    /// Read-modify-write under the store's lock. Returns the stored result.
    async fn update_job(&self, id: &str, update: JobUpdate<'_>) -> Result<Job, StoreError>;

    async fn upsert_worker(&self, worker: &Worker) -> Result<(), StoreError>;
    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, StoreError>;
    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;
    async fn update_worker(&self, id: &str, update: WorkerUpdate<'_>)
        -> Result<Worker, StoreError>;

    async fn append_job_log(&self, log: &JobLog) -> Result<(), StoreError>;
    async fn job_logs(&self) -> Result<Vec<JobLog>, StoreError>;

    /// Queued jobs in dequeue order: priority desc, then oldest first.
    async fn queued_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        sort_for_dequeue(&mut jobs);
        Ok(jobs)
    }

    /// Active job count per assigned worker, from live rows.
    async fn active_counts(&self) -> Result<HashMap<WorkerId, u32>, StoreError> {
        let mut counts = HashMap::new();
        for job in self.list_jobs().await? {
            if let (true, Some(worker)) = (job.is_active(), job.assigned_worker_id) {
                *counts.entry(worker).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn count_active_jobs(&self, worker_id: &str) -> Result<u32, StoreError> {
        Ok(self
            .active_counts()
            .await?
            .get(worker_id)
            .copied()
            .unwrap_or(0))
    }
}

pub fn sort_for_dequeue(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
}

/// Records held in memory. Used by tests and embedders that bring their own persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    workers: Mutex<HashMap<WorkerId, Worker>>,
    logs: Mutex<Vec<JobLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn update_job(&self, id: &str, update: JobUpdate<'_>) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "job",
            id: id.to_string(),
        })?;
        job.touch();
        update(job);
        Ok(job.clone())
    }

    async fn upsert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        self.workers
            .lock()
            .await
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        Ok(self.workers.lock().await.get(id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let mut workers: Vec<Worker> = self.workers.lock().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn update_worker(
        &self,
        id: &str,
        update: WorkerUpdate<'_>,
    ) -> Result<Worker, StoreError> {
        let mut workers = self.workers.lock().await;
        let worker = workers.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "worker",
            id: id.to_string(),
        })?;
        update(worker);
        Ok(worker.clone())
    }

    async fn append_job_log(&self, log: &JobLog) -> Result<(), StoreError> {
        self.logs.lock().await.push(log.clone());
        Ok(())
    }

    async fn job_logs(&self) -> Result<Vec<JobLog>, StoreError> {
        Ok(self.logs.lock().await.clone())
    }
}

/// One JSON file per record under `state_dir`:
///
/// ```text
/// state_dir/jobs/<job id>.json
/// state_dir/workers/<worker id>.json
/// state_dir/job_logs.jsonl
/// ```
///
/// Every read goes to disk so flags written by other processes are picked up.
#[derive(Debug)]
pub struct JsonFileStore {
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (and create) the store directories.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(state_dir.join("jobs"))?;
        std::fs::create_dir_all(state_dir.join("workers"))?;
        Ok(Self {
            state_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.state_dir.join("jobs").join(format!("{}.json", id))
    }

    fn worker_path(&self, id: &str) -> PathBuf {
        self.state_dir.join("workers").join(format!("{}.json", id))
    }

    fn log_path(&self) -> PathBuf {
        self.state_dir.join("job_logs.jsonl")
    }
}

/// Write through a temp file and rename so readers never see a half-written record.
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Loads every record in `dir`. Files that fail to parse are skipped with a warning.
async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut records = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(records)
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.job_path(&job.id), job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        read_json(&self.job_path(id)).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        read_dir_json(&self.state_dir.join("jobs")).await
    }

    async fn update_job(&self, id: &str, update: JobUpdate<'_>) -> Result<Job, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.job_path(id);
        let mut job: Job = read_json(&path).await?.ok_or_else(|| StoreError::NotFound {
            kind: "job",
            id: id.to_string(),
        })?;
        job.touch();
        update(&mut job);
        write_json(&path, &job).await?;
        Ok(job)
    }

    async fn upsert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.worker_path(&worker.id), worker).await
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        read_json(&self.worker_path(id)).await
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let mut workers: Vec<Worker> = read_dir_json(&self.state_dir.join("workers")).await?;
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn update_worker(
        &self,
        id: &str,
        update: WorkerUpdate<'_>,
    ) -> Result<Worker, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.worker_path(id);
        let mut worker: Worker = read_json(&path).await?.ok_or_else(|| StoreError::NotFound {
            kind: "worker",
            id: id.to_string(),
        })?;
        update(&mut worker);
        write_json(&path, &worker).await?;
        Ok(worker)
    }

    async fn append_job_log(&self, log: &JobLog) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(log)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn job_logs(&self) -> Result<Vec<JobLog>, StoreError> {
        let content = match tokio::fs::read_to_string(self.log_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut logs = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(log) => logs.push(log),
                Err(e) => warn!(error = %e, "skipping unreadable job log line"),
            }
        }
        Ok(logs)
    }
}
