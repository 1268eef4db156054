//! Failure recovery: retry with backoff, stuck job sweep, restart recovery.

use crate::cancel::{CancelReason, CancelRegistry};
use crate::encode::LOG_TAIL_LINES;
use crate::error::JobError;
use crate::events::{EventSink, JobEvent};
use crate::jobs::{current_timestamp_ms, Job, JobId, JobLog, JobStatus};
use crate::store::{RecordStore, StoreError};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Delay before retry number `retry_count` (1-based). Capped at the last entry.
///
/// # Example
///
/// ```
/// use fleetcode::recovery::backoff_for;
/// use std::time::Duration;
///
/// let schedule = [1, 5, 15];
/// assert_eq!(backoff_for(1, &schedule), Duration::from_secs(60));
/// assert_eq!(backoff_for(9, &schedule), Duration::from_secs(900));
/// ```
pub fn backoff_for(retry_count: u32, schedule_minutes: &[u64]) -> Duration {
    let index = (retry_count.max(1) as usize - 1).min(schedule_minutes.len().saturating_sub(1));
    let minutes = schedule_minutes.get(index).copied().unwrap_or(1);
    Duration::from_secs(minutes * 60)
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying { retry_count: u32, backoff: Duration },
    Failed,
    Cancelled,
}

fn clip_tail(mut lines: Vec<String>) -> Vec<String> {
    if lines.len() > LOG_TAIL_LINES {
        lines.drain(..lines.len() - LOG_TAIL_LINES);
    }
    lines
}

/// Decide retry or terminal failure for a failed attempt and record it.
///
/// Transient errors under the retry limit re-queue the job unassigned with a backoff
/// deadline. Everything else fails the job for good, writes its [`JobLog`] and emits one
/// `failed` event.
pub async fn handle_failure(
    store: &dyn RecordStore,
    sink: &dyn EventSink,
    job_id: &str,
    error: &JobError,
    backoff_minutes: &[u64],
) -> Result<FailureOutcome, StoreError> {
    let reason = error.to_string();
    let tail = clip_tail(error.log_tail());

    if matches!(error, JobError::Cancelled) {
        let job = store
            .update_job(job_id, &mut |job: &mut Job| {
                job.error_reason = Some(reason.clone());
                job.clear_telemetry();
                job.set_status(JobStatus::Cancelled);
            })
            .await?;
        info!(job_id = %job.id, "job cancelled");
        sink.emit(JobEvent::Cancelled { job_id: job.id });
        return Ok(FailureOutcome::Cancelled);
    }

    let current = store.get_job(job_id).await?.ok_or_else(|| StoreError::NotFound {
        kind: "job",
        id: job_id.to_string(),
    })?;

    if error.is_transient() && current.retry_count < current.max_retries {
        let retry_count = current.retry_count + 1;
        let backoff = backoff_for(retry_count, backoff_minutes);
        let not_before = current_timestamp_ms() + backoff.as_millis() as i64;
        store
            .update_job(job_id, &mut |job: &mut Job| {
                job.retry_count = retry_count;
                job.clear_assignment();
                job.clear_telemetry();
                job.error_reason = Some(reason.clone());
                job.log_tail = tail.clone();
                job.scheduled_after = Some(not_before);
                job.status = JobStatus::Queued;
            })
            .await?;
        warn!(job_id, retry_count, backoff_secs = backoff.as_secs(), error = %reason, "scheduling retry");
        sink.emit(JobEvent::RetryScheduled {
            job_id: job_id.to_string(),
            retry_count,
            backoff_secs: backoff.as_secs(),
            reason,
        });
        return Ok(FailureOutcome::Retrying {
            retry_count,
            backoff,
        });
    }

    let worker_id = current.assigned_worker_id.clone();
    let job = store
        .update_job(job_id, &mut |job: &mut Job| {
            job.clear_telemetry();
            job.fail(&reason, tail.clone());
        })
        .await?;
    store
        .append_job_log(&JobLog::from_job(&job, worker_id))
        .await?;
    sink.emit(JobEvent::Failed {
        job_id: job_id.to_string(),
        reason,
        log_tail: tail,
    });
    Ok(FailureOutcome::Failed)
}

/// Fail every `transcoding` job whose heartbeat is older than `timeout`.
///
/// A job with a live pipeline is cancelled with [`CancelReason::Stuck`]; the pipeline then
/// reports the failure itself. Jobs without one are failed here. Returns the swept ids.
pub async fn sweep_stuck(
    store: &dyn RecordStore,
    sink: &dyn EventSink,
    pipelines: &CancelRegistry,
    timeout: Duration,
    backoff_minutes: &[u64],
) -> Result<Vec<JobId>, StoreError> {
    let cutoff = current_timestamp_ms() - timeout.as_millis() as i64;
    let minutes = timeout.as_secs() / 60;
    let mut swept = Vec::new();

    for job in store.list_jobs().await? {
        if job.status != JobStatus::Transcoding || job.updated_at >= cutoff {
            continue;
        }
        warn!(job_id = %job.id, last_update = job.updated_at, "job is stuck");
        if !pipelines.cancel(&job.id, CancelReason::Stuck) {
            handle_failure(store, sink, &job.id, &JobError::Stuck { minutes }, backoff_minutes)
                .await?;
        }
        swept.push(job.id);
    }
    Ok(swept)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashRecoveryReport {
    pub requeued: Vec<JobId>,
    pub removed_files: usize,
}

/// Reset jobs a previous run left in an active status and clear the staging directory.
pub async fn recover_after_crash(
    store: &dyn RecordStore,
    staging_dir: &Path,
) -> Result<CrashRecoveryReport, StoreError> {
    let mut report = CrashRecoveryReport::default();

    for job in store.list_jobs().await? {
        if !job.is_active() {
            continue;
        }
        store
            .update_job(&job.id, &mut |job: &mut Job| {
                job.clear_assignment();
                job.clear_telemetry();
                job.status = JobStatus::Queued;
            })
            .await?;
        info!(job_id = %job.id, was = %job.status, "requeued after restart");
        report.requeued.push(job.id);
    }

    if staging_dir.exists() {
        for entry in WalkDir::new(staging_dir)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let removed = if entry.file_type().is_dir() {
                std::fs::remove_dir(path).is_ok()
            } else {
                std::fs::remove_file(path).is_ok()
            };
            if removed && !entry.file_type().is_dir() {
                report.removed_files += 1;
            }
        }
    }

    if !report.requeued.is_empty() || report.removed_files > 0 {
        info!(
            requeued = report.requeued.len(),
            removed_files = report.removed_files,
            "crash recovery finished"
        );
    }
    Ok(report)
}
