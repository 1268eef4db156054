//! Metrics snapshot served by the metrics endpoint.
//!
//! The daemon rebuilds the snapshot from the record store and the health monitor's telemetry
//! table on every health round; the HTTP handler only reads it.

use crate::health::{HealthMonitor, WorkerTelemetry};
use crate::jobs::{current_timestamp_ms, Job, JobId, JobStatus, TransferMode, WorkerId};
use crate::store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Live telemetry of one active job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: JobId,
    pub source_path: String,
    pub status: JobStatus,
    pub worker_id: Option<WorkerId>,
    pub transfer_mode: Option<TransferMode>,
    pub progress_percent: Option<f64>,
    pub fps: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub retry_count: u32,
    pub source_size: Option<u64>,
}

impl From<&Job> for JobMetrics {
    fn from(job: &Job) -> Self {
        JobMetrics {
            id: job.id.clone(),
            source_path: job.source_path.clone(),
            status: job.status,
            worker_id: job.assigned_worker_id.clone(),
            transfer_mode: job.transfer_mode,
            progress_percent: job.progress_percent,
            fps: job.current_fps,
            eta_seconds: job.eta_seconds,
            retry_count: job.retry_count,
            source_size: job.source_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    /// Source bytes minus output bytes over completed jobs with both sizes known.
    pub total_bytes_saved: i64,
    pub jobs: Vec<JobMetrics>,
    pub workers: Vec<WorkerTelemetry>,
}

pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Fold job rows and worker telemetry into a snapshot.
pub fn build_snapshot(jobs: &[Job], workers: Vec<WorkerTelemetry>, now_ms: i64) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot {
        timestamp_unix_ms: now_ms,
        workers,
        ..MetricsSnapshot::default()
    };

    for job in jobs {
        match job.status {
            JobStatus::Queued => snapshot.queue_len += 1,
            JobStatus::Completed => {
                snapshot.completed_jobs += 1;
                if let (Some(src), Some(out)) = (job.source_size, job.output_size) {
                    snapshot.total_bytes_saved += src as i64 - out as i64;
                }
            }
            JobStatus::Failed => snapshot.failed_jobs += 1,
            JobStatus::Cancelled => snapshot.cancelled_jobs += 1,
            JobStatus::Transferring
            | JobStatus::Transcoding
            | JobStatus::Verifying
            | JobStatus::Replacing => {
                snapshot.running_jobs += 1;
                snapshot.jobs.push(JobMetrics::from(job));
            }
        }
    }
    snapshot.jobs.sort_by(|a, b| a.id.cmp(&b.id));
    snapshot
}

/// Rebuild `shared` from the store and the monitor's telemetry.
pub async fn refresh(
    shared: &SharedMetrics,
    store: &dyn RecordStore,
    health: &HealthMonitor,
) -> Result<(), StoreError> {
    let jobs = store.list_jobs().await?;
    let snapshot = build_snapshot(&jobs, health.snapshot().await, current_timestamp_ms());
    *shared.write().await = snapshot;
    Ok(())
}
