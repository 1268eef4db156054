//! Job records and their lifecycle helpers.
//!
//! A job moves `queued -> transferring -> transcoding -> verifying -> replacing -> completed`,
//! with `failed` and `cancelled` as the other terminal states. Retries put a failed job back
//! into `queued` with a backoff deadline.

use crate::encode::EncodeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type JobId = String;
pub type WorkerId = String;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker or for its backoff deadline.
    #[default]
    Queued,
    /// Moving the source or the output between hosts.
    Transferring,
    /// The encoder is running.
    Transcoding,
    /// Probing the encoded output.
    Verifying,
    /// Swapping the output into the original's place.
    Replacing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Statuses that count against a worker's capacity.
    pub const ACTIVE: [JobStatus; 4] = [
        JobStatus::Transferring,
        JobStatus::Transcoding,
        JobStatus::Verifying,
        JobStatus::Replacing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Transferring => "transferring",
            JobStatus::Transcoding => "transcoding",
            JobStatus::Verifying => "verifying",
            JobStatus::Replacing => "replacing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the source reaches the worker and the output comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Local worker reads the source path as-is.
    Local,
    /// The worker sees the source through a path mapping (shared mount).
    Mapped,
    /// Local worker pulls the source from the origin over SSH and pushes the result back.
    SshPull,
    /// Remote worker gets the source uploaded and the result downloaded.
    SshTransfer,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Local => "local",
            TransferMode::Mapped => "mapped",
            TransferMode::SshPull => "ssh_pull",
            TransferMode::SshTransfer => "ssh_transfer",
        }
    }

    /// Status a job enters when dispatched in this mode.
    pub fn first_status(&self) -> JobStatus {
        match self {
            TransferMode::Local | TransferMode::Mapped => JobStatus::Transcoding,
            TransferMode::SshPull | TransferMode::SshTransfer => JobStatus::Transferring,
        }
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

/// A transcoding job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: JobId,
    /// Catalog item this job was created for; absent for manual jobs.
    #[serde(default)]
    pub media_item_id: Option<String>,
    /// Resolved encode configuration.
    pub config: EncodeConfig,
    pub status: JobStatus,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,

    // Live telemetry, cleared on retry.
    #[serde(default)]
    pub progress_percent: Option<f64>,
    #[serde(default)]
    pub current_fps: Option<f64>,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub checkpoint_frame: Option<u64>,

    pub source_path: String,
    #[serde(default)]
    pub source_size: Option<u64>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_size: Option<u64>,

    #[serde(default)]
    pub transfer_mode: Option<TransferMode>,
    #[serde(default)]
    pub worker_input_path: Option<String>,
    #[serde(default)]
    pub worker_output_path: Option<String>,
    #[serde(default)]
    pub assigned_worker_id: Option<WorkerId>,
    /// The source already sits in the worker's scratch directory.
    #[serde(default)]
    pub source_prestaged: bool,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub validation_status: Option<ValidationStatus>,
    /// Not eligible for dequeue before this time (ms since epoch).
    #[serde(default)]
    pub scheduled_after: Option<i64>,
    /// Manual jobs write a sibling file and never replace the source.
    #[serde(default)]
    pub is_manual: bool,
    /// Set by out-of-process tools; the daemon turns it into a cancellation.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set once the encoder fell back to software; the scheduler no longer upgrades it.
    #[serde(default)]
    pub hw_fallback_applied: bool,

    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub log_tail: Vec<String>,

    /// Unix timestamp (milliseconds) when job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last mutation. Doubles as the telemetry heartbeat.
    pub updated_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

fn default_max_retries() -> u32 {
    3
}

impl Job {
    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Set the status and update timestamp.
    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        if status == JobStatus::Transferring || status == JobStatus::Transcoding {
            self.started_at.get_or_insert_with(current_timestamp_ms);
        }
        if status.is_terminal() {
            self.completed_at = Some(current_timestamp_ms());
        }
        self.touch();
    }

    /// Mark the job as terminally failed with a reason.
    pub fn fail(&mut self, reason: &str, log_tail: Vec<String>) {
        self.error_reason = Some(reason.to_string());
        self.log_tail = log_tail;
        self.set_status(JobStatus::Failed);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Drop the worker assignment together with everything derived from it.
    pub fn clear_assignment(&mut self) {
        self.assigned_worker_id = None;
        self.transfer_mode = None;
        self.worker_input_path = None;
        self.worker_output_path = None;
        self.source_prestaged = false;
    }

    pub fn clear_telemetry(&mut self) {
        self.progress_percent = None;
        self.current_fps = None;
        self.eta_seconds = None;
        self.checkpoint_frame = None;
    }

    /// Whether the dequeue loop may pick this job up at `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == JobStatus::Queued
            && !self.cancel_requested
            && self.scheduled_after.map_or(true, |after| after <= now_ms)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Creates a queued job for a catalog item.
pub fn create_job(
    source_path: &str,
    config: EncodeConfig,
    media_item_id: Option<String>,
    priority: i32,
    max_retries: u32,
) -> Job {
    let now = current_timestamp_ms();
    Job {
        id: Uuid::new_v4().to_string(),
        media_item_id,
        config,
        status: JobStatus::Queued,
        priority,
        progress_percent: None,
        current_fps: None,
        eta_seconds: None,
        checkpoint_frame: None,
        source_path: source_path.to_string(),
        source_size: None,
        output_path: None,
        output_size: None,
        transfer_mode: None,
        worker_input_path: None,
        worker_output_path: None,
        assigned_worker_id: None,
        source_prestaged: false,
        retry_count: 0,
        max_retries,
        validation_status: None,
        scheduled_after: None,
        is_manual: false,
        cancel_requested: false,
        hw_fallback_applied: false,
        error_reason: None,
        log_tail: Vec::new(),
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
    }
}

/// Creates a manual job. Its output lands beside the source as `"{stem} V2.{container}"`.
pub fn create_manual_job(
    source_path: &str,
    config: EncodeConfig,
    priority: i32,
    max_retries: u32,
) -> Job {
    let output = manual_output_path(source_path, &config.container);
    let mut job = create_job(source_path, config, None, priority, max_retries);
    job.is_manual = true;
    job.output_path = Some(output);
    job
}

/// `"/media/Movie.mkv"` with container `mp4` -> `"/media/Movie V2.mp4"`.
pub fn manual_output_path(source_path: &str, container: &str) -> String {
    let path = Path::new(source_path);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = format!("{} V2.{}", stem, container);
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.join(file_name).to_string_lossy().into_owned()
        }
        _ => file_name,
    }
}

/// Immutable summary written once a job reaches `completed` or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobLog {
    pub job_id: JobId,
    pub worker_id: Option<WorkerId>,
    pub media_item_id: Option<String>,
    pub status: JobStatus,
    pub source_size: Option<u64>,
    pub output_size: Option<u64>,
    /// `1 - output/source`, when both sizes are known.
    pub size_reduction: Option<f64>,
    pub duration_secs: Option<f64>,
    pub avg_fps: Option<f64>,
    pub reason: Option<String>,
    pub logged_at: i64,
}

impl JobLog {
    pub fn from_job(job: &Job, worker_id: Option<WorkerId>) -> Self {
        let size_reduction = match (job.source_size, job.output_size) {
            (Some(src), Some(out)) if src > 0 => Some(1.0 - out as f64 / src as f64),
            _ => None,
        };
        let duration_secs = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start) as f64 / 1000.0),
            _ => None,
        };
        Self {
            job_id: job.id.clone(),
            worker_id,
            media_item_id: job.media_item_id.clone(),
            status: job.status,
            source_size: job.source_size,
            output_size: job.output_size,
            size_reduction,
            duration_secs,
            avg_fps: job.current_fps,
            reason: job.error_reason.clone(),
            logged_at: current_timestamp_ms(),
        }
    }
}

/// Staging file name for a job's pulled source or downloaded output.
pub fn staging_file(staging_dir: &Path, job_id: &str, path: &str) -> PathBuf {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_string());
    staging_dir.join(format!("{}_{}", job_id, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job_status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Queued),
            Just(JobStatus::Transferring),
            Just(JobStatus::Transcoding),
            Just(JobStatus::Verifying),
            Just(JobStatus::Replacing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_active_and_terminal_are_disjoint(status in job_status_strategy()) {
            prop_assert!(!(status.is_active() && status.is_terminal()));
            if status == JobStatus::Queued {
                prop_assert!(!status.is_active() && !status.is_terminal());
            }
        }

        #[test]
        fn prop_status_serializes_as_str(status in job_status_strategy()) {
            let json = serde_json::to_string(&status).unwrap();
            prop_assert_eq!(json, format!("\"{}\"", status.as_str()));
        }

        #[test]
        fn prop_future_schedule_is_not_due(delay in 1i64..10_000_000, now in 0i64..2_000_000_000_000) {
            let mut job = create_job("/m/a.mkv", EncodeConfig::default(), None, 0, 3);
            job.scheduled_after = Some(now + delay);
            prop_assert!(!job.is_due(now));
            prop_assert!(job.is_due(now + delay));
        }
    }

    #[test]
    fn test_clear_assignment_clears_derived_fields() {
        let mut job = create_job("/m/a.mkv", EncodeConfig::default(), None, 0, 3);
        job.assigned_worker_id = Some("w1".into());
        job.transfer_mode = Some(TransferMode::SshTransfer);
        job.worker_input_path = Some("/tmp/fleetcode/a.mkv".into());
        job.worker_output_path = Some("/tmp/fleetcode/a.fleetcode.mkv".into());
        job.source_prestaged = true;

        job.clear_assignment();

        assert!(job.assigned_worker_id.is_none());
        assert!(job.transfer_mode.is_none());
        assert!(job.worker_input_path.is_none());
        assert!(job.worker_output_path.is_none());
        assert!(!job.source_prestaged);
    }

    #[test]
    fn test_manual_output_path() {
        assert_eq!(
            manual_output_path("/media/Movie (2020).mkv", "mp4"),
            "/media/Movie (2020) V2.mp4"
        );
        assert_eq!(manual_output_path("clip.mov", "mkv"), "clip V2.mkv");
    }

    #[test]
    fn test_manual_job_has_output_beside_source() {
        let job = create_manual_job("/media/a.mkv", EncodeConfig::default(), 5, 3);
        assert!(job.is_manual);
        assert_eq!(job.output_path.as_deref(), Some("/media/a V2.mkv"));
        assert_eq!(job.priority, 5);
    }

    #[test]
    fn test_set_status_tracks_timestamps() {
        let mut job = create_job("/m/a.mkv", EncodeConfig::default(), None, 0, 3);
        assert!(job.started_at.is_none());
        job.set_status(JobStatus::Transcoding);
        let started = job.started_at;
        assert!(started.is_some());
        job.set_status(JobStatus::Verifying);
        assert_eq!(job.started_at, started);
        job.set_status(JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_job_log_size_reduction() {
        let mut job = create_job("/m/a.mkv", EncodeConfig::default(), Some("item-1".into()), 0, 3);
        job.source_size = Some(1000);
        job.output_size = Some(400);
        job.set_status(JobStatus::Completed);
        let log = JobLog::from_job(&job, Some("w1".into()));
        assert_eq!(log.status, JobStatus::Completed);
        assert!((log.size_reduction.unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(log.media_item_id.as_deref(), Some("item-1"));
    }

    #[test]
    fn test_job_json_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "j1",
            "config": {"video_codec": "libx265"},
            "status": "queued",
            "source_path": "/m/a.mkv",
            "created_at": 1,
            "updated_at": 1
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.max_retries, 3);
        assert!(!job.source_prestaged);
        assert!(job.assigned_worker_id.is_none());
    }
}
