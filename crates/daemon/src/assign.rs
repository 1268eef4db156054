//! Worker selection.
//!
//! Each available worker gets a weighted cost, lower is better:
//!
//! ```text
//! score = 0.35 * transfer_cost + 0.30 * (100 - performance) + 0.35 * load_cost
//! ```
//!
//! Workers at capacity are skipped unless every worker is at capacity, in which case the
//! least loaded choice is made anyway.

use crate::encode::{EncodeConfig, VideoCodec};
use crate::jobs::{Job, TransferMode, WorkerId};
use crate::mode::{self, ResolvedMode};
use crate::workers::{HardwareFamily, Worker};
use std::collections::HashMap;
use tracing::{debug, info};

pub const TRANSFER_WEIGHT: f64 = 0.35;
pub const PERFORMANCE_WEIGHT: f64 = 0.30;
pub const LOAD_WEIGHT: f64 = 0.35;

/// Cost of moving data for a mode, 0-75.
pub fn transfer_cost(mode: TransferMode) -> f64 {
    match mode {
        TransferMode::Local => 0.0,
        TransferMode::Mapped => 25.0,
        TransferMode::SshPull => 50.0,
        TransferMode::SshTransfer => 75.0,
    }
}

/// `100 * active / max(capacity, 1)`.
pub fn load_cost(active: u32, max_concurrent_jobs: u32) -> f64 {
    100.0 * active as f64 / max_concurrent_jobs.max(1) as f64
}

pub fn score(transfer: f64, performance: f64, load: f64) -> f64 {
    TRANSFER_WEIGHT * transfer + PERFORMANCE_WEIGHT * (100.0 - performance) + LOAD_WEIGHT * load
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub mode: TransferMode,
    /// Path the worker reads the source from, for local and mapped modes.
    pub worker_path: Option<String>,
    pub score: f64,
    /// Replacement config when the job was upgraded to a hardware encoder.
    pub upgraded_config: Option<EncodeConfig>,
}

impl Assignment {
    /// Write the assignment into the job record.
    pub fn apply(&self, job: &mut Job) {
        job.assigned_worker_id = Some(self.worker_id.clone());
        job.transfer_mode = Some(self.mode);
        job.worker_input_path = self.worker_path.clone();
        job.worker_output_path = None;
        if let Some(config) = &self.upgraded_config {
            job.config = config.clone();
        }
        job.touch();
    }
}

#[derive(Debug, Clone)]
pub struct WorkerScheduler {
    origin_has_ssh: bool,
    auto_hardware_upgrade: bool,
}

impl WorkerScheduler {
    pub fn new(origin_has_ssh: bool, auto_hardware_upgrade: bool) -> Self {
        Self {
            origin_has_ssh,
            auto_hardware_upgrade,
        }
    }

    fn resolve(&self, job: &Job, worker: &Worker) -> ResolvedMode {
        mode::resolve(
            &job.source_path,
            worker.is_local,
            &worker.path_mappings,
            self.origin_has_ssh,
        )
    }

    /// Only a job's first assignment is upgraded. Retries keep the config that last ran.
    fn upgrade(&self, job: &Job, worker: &Worker) -> Option<EncodeConfig> {
        if !self.auto_hardware_upgrade
            || job.retry_count > 0
            || job.hw_fallback_applied
            || !worker.has_hardware(HardwareFamily::Nvenc)
        {
            return None;
        }
        let mut config = job.config.clone();
        let from: VideoCodec = config.video_codec;
        if config.upgrade_to_nvenc() {
            info!(job_id = %job.id, worker_id = %worker.id, from = %from, to = %config.video_codec, "upgrading to hardware encoder");
            Some(config)
        } else {
            None
        }
    }

    fn assignment(&self, job: &Job, worker: &Worker, score: f64) -> Assignment {
        let resolved = self.resolve(job, worker);
        Assignment {
            worker_id: worker.id.clone(),
            mode: resolved.mode,
            worker_path: resolved.worker_path,
            score,
            upgraded_config: self.upgrade(job, worker),
        }
    }

    /// Score of `worker` for `job` given its current active job count.
    pub fn score_worker(&self, job: &Job, worker: &Worker, active: u32) -> f64 {
        let resolved = self.resolve(job, worker);
        score(
            transfer_cost(resolved.mode),
            worker.performance(),
            load_cost(active, worker.max_concurrent_jobs),
        )
    }

    /// Pick a worker for `job`, or `None` when nobody is available.
    ///
    /// # Arguments
    /// * `workers` - Candidate workers; disabled and offline ones are ignored
    /// * `active_counts` - Jobs in an active status per worker
    /// * `preferred` - Worker to use directly when it is available
    pub fn assign(
        &self,
        job: &Job,
        workers: &[Worker],
        active_counts: &HashMap<WorkerId, u32>,
        preferred: Option<&str>,
    ) -> Option<Assignment> {
        if let Some(worker) = preferred
            .and_then(|id| workers.iter().find(|w| w.id == id))
            .filter(|w| w.is_available())
        {
            debug!(job_id = %job.id, worker_id = %worker.id, "using preferred worker");
            return Some(self.assignment(job, worker, 0.0));
        }

        let candidates: Vec<(&Worker, u32, f64)> = workers
            .iter()
            .filter(|w| w.is_available())
            .map(|w| {
                let active = active_counts.get(&w.id).copied().unwrap_or(0);
                (w, active, self.score_worker(job, w, active))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let best = |with_capacity_gate: bool| {
            candidates
                .iter()
                .filter(|(w, active, _)| !with_capacity_gate || *active < w.max_concurrent_jobs)
                .min_by(|a, b| a.2.total_cmp(&b.2))
        };

        let (worker, active, score) = match best(true) {
            Some(choice) => choice,
            None => {
                debug!(job_id = %job.id, "every worker at capacity, assigning least costly");
                best(false)?
            }
        };
        debug!(job_id = %job.id, worker_id = %worker.id, active, score, "selected worker");
        Some(self.assignment(job, worker, *score))
    }
}
