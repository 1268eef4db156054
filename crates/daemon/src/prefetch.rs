//! Source prefetching.
//!
//! While a worker is busy encoding, the next job queued for it can have its source copied
//! into the worker's scratch directory so its transfer leg is already done when it starts.

use crate::cancel::{lock, CancelReason, CancelRegistry};
use crate::error::JobError;
use crate::events::{JobEvent, SharedSink};
use crate::jobs::{current_timestamp_ms, Job, JobId, JobStatus, TransferMode, WorkerId};
use crate::store::{RecordStore, StoreError};
use crate::transfer::{
    ProgressFn, TransferEngine, TransferError, TransferOutcome, TransferProgress,
};
use crate::transport::{Direction, Transport, TransportFactory};
use crate::workers::Worker;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Put a job's source at `remote_path` on `worker_host`.
///
/// Sources visible on this machine are uploaded; anything else is relayed from the origin.
pub async fn stage_source(
    engine: &TransferEngine,
    worker_host: &Arc<dyn Transport>,
    origin: Option<&Arc<dyn Transport>>,
    source_path: &str,
    remote_path: &str,
    progress: ProgressFn,
    cancel: &CancellationToken,
) -> Result<TransferOutcome, JobError> {
    let result = if tokio::fs::metadata(source_path).await.is_ok() {
        engine
            .transfer(
                worker_host,
                Direction::Upload,
                Path::new(source_path),
                remote_path,
                progress,
                cancel,
            )
            .await
    } else if let Some(origin) = origin {
        engine
            .relay(origin, source_path, worker_host, remote_path, progress, cancel)
            .await
    } else {
        return Err(JobError::SourceNotAccessible(source_path.to_string()));
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(TransferError::SourceMissing(path)) => Err(JobError::SourceNotAccessible(path)),
        Err(e) => Err(e.into()),
    }
}

/// Background source staging, at most one task per worker.
#[derive(Clone)]
pub struct Prefetcher {
    store: Arc<dyn RecordStore>,
    transports: Arc<dyn TransportFactory>,
    engine: TransferEngine,
    events: SharedSink,
    tasks: CancelRegistry,
    by_worker: Arc<Mutex<HashMap<WorkerId, JobId>>>,
}

impl Prefetcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transports: Arc<dyn TransportFactory>,
        engine: TransferEngine,
        events: SharedSink,
    ) -> Self {
        Self {
            store,
            transports,
            engine,
            events,
            tasks: CancelRegistry::new(),
            by_worker: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a prefetch for `job_id` is still running.
    pub fn is_prefetching(&self, job_id: &str) -> bool {
        self.tasks.contains(job_id)
    }

    /// Stop a running prefetch. The task removes its partial file.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.tasks.cancel(job_id, CancelReason::Operator)
    }

    pub fn cancel_all(&self) {
        self.tasks.cancel_all(CancelReason::Operator);
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Start prefetches for workers that are encoding and have a staged-transfer job waiting.
    /// Returns the job ids that were started.
    pub async fn tick(&self) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.store.list_jobs().await?;
        let now = current_timestamp_ms();
        let mut started = Vec::new();

        for worker in self.store.list_workers().await? {
            if !worker.is_available() || lock(&self.by_worker).contains_key(&worker.id) {
                continue;
            }
            let encoding = jobs.iter().any(|j| {
                j.status == JobStatus::Transcoding
                    && j.assigned_worker_id.as_deref() == Some(worker.id.as_str())
            });
            if !encoding {
                continue;
            }
            if let Some(next) = next_candidate(&jobs, &worker.id, now) {
                started.push(next.id.clone());
                self.spawn(next.clone(), worker);
            }
        }
        Ok(started)
    }

    fn spawn(&self, job: Job, worker: Worker) {
        let handle = self.tasks.register(&job.id);
        lock(&self.by_worker).insert(worker.id.clone(), job.id.clone());
        let this = self.clone();
        info!(job_id = %job.id, worker_id = %worker.id, "starting source prefetch");

        tokio::spawn(async move {
            let result = this.prefetch(&job, &worker, &handle.token).await;
            match result {
                Ok(()) => info!(job_id = %job.id, worker_id = %worker.id, "source prestaged"),
                Err(e) => warn!(job_id = %job.id, worker_id = %worker.id, error = %e, "prefetch abandoned"),
            }
            this.tasks.remove(&job.id);
            lock(&this.by_worker).remove(&worker.id);
        });
    }

    async fn prefetch(
        &self,
        job: &Job,
        worker: &Worker,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let host = self.transports.for_worker(worker)?;
        let origin = self.transports.origin();
        let remote = worker.scratch_path(&job.id, &job.source_path);
        let events = self.events.clone();
        let job_id = job.id.clone();
        let progress: ProgressFn = Arc::new(move |p: TransferProgress| {
            events.emit(JobEvent::transfer(&job_id, &p))
        });

        let staged = stage_source(
            &self.engine,
            &host,
            origin.as_ref(),
            &job.source_path,
            &remote,
            progress,
            cancel,
        )
        .await;

        let outcome = match staged {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rm) = host.remove_file(&remote).await {
                    debug!(path = %remote, error = %rm, "could not remove partial prefetch");
                }
                return Err(e);
            }
        };

        let worker_id = worker.id.clone();
        let mut applied = false;
        self.store
            .update_job(&job.id, &mut |j: &mut Job| {
                // the job may have been cancelled or reassigned meanwhile
                if j.status == JobStatus::Queued
                    && j.assigned_worker_id.as_deref() == Some(worker_id.as_str())
                {
                    j.source_prestaged = true;
                    j.worker_input_path = Some(remote.clone());
                    j.source_size = Some(outcome.bytes);
                    applied = true;
                }
            })
            .await?;
        if !applied {
            let _ = host.remove_file(&remote).await;
        }
        Ok(())
    }
}

/// Next queued job bound to `worker_id` that still needs its source staged.
fn next_candidate<'a>(jobs: &'a [Job], worker_id: &str, now_ms: i64) -> Option<&'a Job> {
    let mut candidates: Vec<&Job> = jobs
        .iter()
        .filter(|j| {
            j.is_due(now_ms)
                && j.assigned_worker_id.as_deref() == Some(worker_id)
                && j.transfer_mode == Some(TransferMode::SshTransfer)
                && !j.source_prestaged
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    candidates.into_iter().next()
}
