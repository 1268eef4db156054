//! Job and worker events.

use crate::jobs::{JobId, JobStatus, WorkerId};
use crate::transfer::TransferProgress;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged {
        job_id: JobId,
        status: JobStatus,
    },
    Progress {
        job_id: JobId,
        percent: Option<f64>,
        fps: Option<f64>,
        eta_seconds: Option<u64>,
    },
    TransferProgress {
        job_id: JobId,
        bytes: u64,
        total: u64,
        percent: f64,
    },
    /// Something operators should see, like a hardware fallback.
    Log {
        job_id: JobId,
        message: String,
    },
    RetryScheduled {
        job_id: JobId,
        retry_count: u32,
        backoff_secs: u64,
        reason: String,
    },
    Failed {
        job_id: JobId,
        reason: String,
        log_tail: Vec<String>,
    },
    Completed {
        job_id: JobId,
        output_path: Option<String>,
    },
    Cancelled {
        job_id: JobId,
    },
    WorkerOnline {
        worker_id: WorkerId,
    },
    WorkerOffline {
        worker_id: WorkerId,
        consecutive_failures: u32,
    },
    WorkerDisabled {
        worker_id: WorkerId,
    },
}

impl JobEvent {
    pub fn transfer(job_id: &str, progress: &TransferProgress) -> Self {
        JobEvent::TransferProgress {
            job_id: job_id.to_string(),
            bytes: progress.bytes,
            total: progress.total,
            percent: progress.percent,
        }
    }
}

/// Receives job and worker events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: JobEvent) {
        match &event {
            JobEvent::StatusChanged { job_id, status } => {
                info!(%job_id, %status, "job status changed")
            }
            JobEvent::Progress {
                job_id,
                percent,
                fps,
                ..
            } => debug!(%job_id, ?percent, ?fps, "encode progress"),
            JobEvent::TransferProgress {
                job_id,
                bytes,
                total,
                ..
            } => debug!(%job_id, bytes, total, "transfer progress"),
            JobEvent::Log { job_id, message } => warn!(%job_id, "{}", message),
            JobEvent::RetryScheduled {
                job_id,
                retry_count,
                backoff_secs,
                reason,
            } => warn!(%job_id, retry_count, backoff_secs, %reason, "retry scheduled"),
            JobEvent::Failed {
                job_id,
                reason,
                log_tail,
            } => error!(%job_id, %reason, log_lines = log_tail.len(), "job failed"),
            JobEvent::Completed {
                job_id,
                output_path,
            } => info!(%job_id, ?output_path, "job completed"),
            JobEvent::Cancelled { job_id } => info!(%job_id, "job cancelled"),
            JobEvent::WorkerOnline { worker_id } => info!(%worker_id, "worker online"),
            JobEvent::WorkerOffline {
                worker_id,
                consecutive_failures,
            } => warn!(%worker_id, consecutive_failures, "worker offline"),
            JobEvent::WorkerDisabled { worker_id } => {
                error!(%worker_id, "worker disabled after repeated failures")
            }
        }
    }
}

/// Fans events out to any number of subscribers. Slow subscribers lose old events.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Sends every event to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: JobEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
