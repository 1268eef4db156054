//! Job executor
//!
//! Drives one job from dispatch to a terminal status. The legs depend on the transfer mode:
//!
//! | mode           | legs                                                              |
//! |----------------|-------------------------------------------------------------------|
//! | `local`        | transcode, verify, replace                                        |
//! | `mapped`       | transcode on the worker's view of the file, verify, replace       |
//! | `ssh_pull`     | download from origin, transcode, verify, upload, replace on origin |
//! | `ssh_transfer` | stage on worker, remote transcode, verify on worker, fetch, replace |
//!
//! Manual jobs write a sibling file and skip the replace leg.

mod encode;

use crate::cancel::{CancelHandle, CancelReason};
use crate::config::ValidationConfig;
use crate::encode::EncoderInvocation;
use crate::error::JobError;
use crate::events::{JobEvent, SharedSink};
use crate::jobs::{
    manual_output_path, staging_file, Job, JobLog, JobStatus, TransferMode, ValidationStatus,
};
use crate::prefetch::stage_source;
use crate::probe::MediaProbe;
use crate::recovery::{handle_failure, FailureOutcome};
use crate::replace::{final_path, replace_local, replace_remote};
use crate::store::{RecordStore, StoreError};
use crate::transfer::{ProgressFn, TransferEngine, TransferProgress};
use crate::transport::{Direction, Transport, TransportFactory};
use crate::validate::{validate_output, ValidationResult};
use crate::workers::Worker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executor tunables taken from the daemon configuration.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Local scratch space for pulled sources and outputs.
    pub staging_dir: PathBuf,
    pub validation: ValidationConfig,
    pub backoff_minutes: Vec<u64>,
    pub stuck_timeout_minutes: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("/tmp/fleetcode"),
            validation: ValidationConfig::default(),
            backoff_minutes: vec![1, 5, 15],
            stuck_timeout_minutes: 30,
        }
    }
}

/// How a pipeline ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Recovered(FailureOutcome),
}

/// Runs job pipelines. Cheap to clone; every collaborator sits behind an `Arc`.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn RecordStore>,
    events: SharedSink,
    transports: Arc<dyn TransportFactory>,
    encoder: Arc<dyn EncoderInvocation>,
    probe: Arc<dyn MediaProbe>,
    engine: TransferEngine,
    settings: ExecutorSettings,
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        events: SharedSink,
        transports: Arc<dyn TransportFactory>,
        encoder: Arc<dyn EncoderInvocation>,
        probe: Arc<dyn MediaProbe>,
        engine: TransferEngine,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            events,
            transports,
            encoder,
            probe,
            engine,
            settings,
        }
    }

    /// Run a dispatched job to the end and record the outcome.
    ///
    /// Failures are handed to [`handle_failure`], which re-queues or fails the job. A
    /// cancellation from the stuck sweep counts as a stuck failure, not an operator cancel.
    pub async fn run(
        &self,
        job: Job,
        worker: Worker,
        cancel: CancelHandle,
    ) -> Result<RunOutcome, StoreError> {
        info!(
            job_id = %job.id,
            worker_id = %worker.id,
            mode = ?job.transfer_mode,
            source = %job.source_path,
            "starting job"
        );
        let result = self.execute(&job, &worker, &cancel.token).await;

        let error = match result {
            Ok(()) => return Ok(RunOutcome::Completed),
            Err(JobError::Cancelled) if cancel.reason() == Some(CancelReason::Stuck) => {
                JobError::Stuck {
                    minutes: self.settings.stuck_timeout_minutes,
                }
            }
            Err(e) => e,
        };

        if error.is_transient() {
            warn!(job_id = %job.id, error = %error, "job attempt failed");
        } else if !matches!(error, JobError::Cancelled) {
            error!(job_id = %job.id, error = %error, "job failed");
        }
        let outcome = handle_failure(
            self.store.as_ref(),
            self.events.as_ref(),
            &job.id,
            &error,
            &self.settings.backoff_minutes,
        )
        .await?;
        Ok(RunOutcome::Recovered(outcome))
    }

    async fn execute(
        &self,
        job: &Job,
        worker: &Worker,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        check_cancel(cancel)?;
        let mode = job
            .transfer_mode
            .ok_or_else(|| JobError::TransferFailed {
                reason: "no transfer mode resolved".to_string(),
                log_tail: Vec::new(),
            })?;
        self.set_status(&job.id, mode.first_status()).await?;

        match mode {
            TransferMode::Local | TransferMode::Mapped => {
                self.run_direct(job, worker, mode, cancel).await
            }
            TransferMode::SshPull => self.run_ssh_pull(job, worker, cancel).await,
            TransferMode::SshTransfer => self.run_ssh_transfer(job, worker, cancel).await,
        }
    }

    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), JobError> {
        self.store
            .update_job(job_id, &mut |j: &mut Job| j.set_status(status))
            .await?;
        self.events.emit(JobEvent::StatusChanged {
            job_id: job_id.to_string(),
            status,
        });
        Ok(())
    }

    fn transfer_progress(&self, job_id: &str) -> ProgressFn {
        let events = self.events.clone();
        let job_id = job_id.to_string();
        Arc::new(move |p: TransferProgress| events.emit(JobEvent::transfer(&job_id, &p)))
    }

    async fn source_duration(&self, host: &dyn Transport, path: &str) -> Option<f64> {
        match self.probe.probe(host, path).await {
            Ok(result) => result.duration(),
            Err(e) => {
                warn!(path, error = %e, "could not probe source, skipping duration check");
                None
            }
        }
    }

    /// Where the encoder writes for a source: the manual sibling name or the tagged name.
    fn output_for(&self, job: &Job, input: &str) -> String {
        if job.is_manual {
            manual_output_path(input, &job.config.container)
        } else {
            self.encoder.output_path(&job.config, input)
        }
    }

    /// Probe the output where it was written and check it. Returns its size.
    async fn verify(
        &self,
        job_id: &str,
        host: &dyn Transport,
        output: &str,
        source_duration: Option<f64>,
    ) -> Result<u64, JobError> {
        self.set_status(job_id, JobStatus::Verifying).await?;
        let probed = match self.probe.probe(host, output).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(job_id, output, error = %e, "output probe failed");
                None
            }
        };
        let size = host.file_size(output).await?;

        match validate_output(
            probed.as_ref(),
            size,
            source_duration,
            &self.settings.validation,
        ) {
            ValidationResult::Pass => {
                self.store
                    .update_job(job_id, &mut |j: &mut Job| {
                        j.validation_status = Some(ValidationStatus::Passed);
                        j.output_size = size;
                    })
                    .await?;
                debug!(job_id, output, ?size, "output validated");
                Ok(size.unwrap_or(0))
            }
            ValidationResult::Reject { reason } => {
                self.store
                    .update_job(job_id, &mut |j: &mut Job| {
                        j.validation_status = Some(ValidationStatus::Failed);
                    })
                    .await?;
                Err(JobError::ValidationFailed(reason))
            }
        }
    }

    async fn complete(
        &self,
        job_id: &str,
        worker: &Worker,
        output_path: String,
        output_size: u64,
    ) -> Result<(), JobError> {
        let job = self
            .store
            .update_job(job_id, &mut |j: &mut Job| {
                j.output_path = Some(output_path.clone());
                j.output_size = Some(output_size);
                j.progress_percent = Some(100.0);
                j.eta_seconds = Some(0);
                j.error_reason = None;
                j.log_tail.clear();
                j.set_status(JobStatus::Completed);
            })
            .await?;
        self.store
            .append_job_log(&JobLog::from_job(&job, Some(worker.id.clone())))
            .await?;
        info!(job_id, output = %output_path, output_size, "job completed");
        self.events.emit(JobEvent::Completed {
            job_id: job_id.to_string(),
            output_path: Some(output_path),
        });
        Ok(())
    }

    /// `local` and `mapped`: the worker reads the source where it lies.
    async fn run_direct(
        &self,
        job: &Job,
        worker: &Worker,
        mode: TransferMode,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let host = self.transports.for_worker(worker)?;
        let input = job
            .worker_input_path
            .clone()
            .unwrap_or_else(|| job.source_path.clone());

        let Some(source_size) = host.file_size(&input).await? else {
            return Err(JobError::SourceNotAccessible(input));
        };
        self.store
            .update_job(&job.id, &mut |j: &mut Job| j.source_size = Some(source_size))
            .await?;

        let duration = self.source_duration(host.as_ref(), &input).await;
        let output = self.output_for(job, &input);

        let result: Result<(), JobError> = async {
            let config = self
                .transcode(job, worker, host.as_ref(), &input, &output, duration, cancel)
                .await?;
            let size = self
                .verify(&job.id, host.as_ref(), &output, duration)
                .await?;
            check_cancel(cancel)?;

            let final_output = if job.is_manual {
                job.output_path.clone().unwrap_or_else(|| output.clone())
            } else {
                self.set_status(&job.id, JobStatus::Replacing).await?;
                let replaced = if mode == TransferMode::Local && worker.is_local {
                    replace_local(Path::new(&input), Path::new(&output), &config.container)
                        .await
                        .map(|p| p.to_string_lossy().into_owned())
                } else {
                    replace_remote(host.as_ref(), &input, &output, &config.container).await
                };
                replaced?;
                // report in the origin's namespace
                final_path(Path::new(&job.source_path), &config.container)
                    .to_string_lossy()
                    .into_owned()
            };
            self.complete(&job.id, worker, final_output, size).await
        }
        .await;

        if result.is_err() {
            remove_quietly(host.as_ref(), &output).await;
        }
        result
    }

    /// `ssh_pull`: a local worker pulls the source from the origin and pushes the result back.
    async fn run_ssh_pull(
        &self,
        job: &Job,
        worker: &Worker,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let origin = self.transports.origin().ok_or_else(|| {
            JobError::SourceNotAccessible(format!(
                "{} (origin is not reachable over SSH)",
                job.source_path
            ))
        })?;
        let local = self.transports.local();

        let Some(source_size) = origin.file_size(&job.source_path).await? else {
            return Err(JobError::SourceNotAccessible(job.source_path.clone()));
        };
        self.store
            .update_job(&job.id, &mut |j: &mut Job| j.source_size = Some(source_size))
            .await?;

        let staged_in = staging_file(&self.settings.staging_dir, &job.id, &job.source_path);
        let remote_target = if job.is_manual {
            job.output_path
                .clone()
                .unwrap_or_else(|| manual_output_path(&job.source_path, &job.config.container))
        } else {
            self.encoder.output_path(&job.config, &job.source_path)
        };
        let staged_out = staging_file(&self.settings.staging_dir, &job.id, &remote_target);
        let staged_in_str = staged_in.to_string_lossy().into_owned();
        let staged_out_str = staged_out.to_string_lossy().into_owned();

        let result: Result<(), JobError> = async {
            check_cancel(cancel)?;
            self.engine
                .transfer(
                    &origin,
                    Direction::Download,
                    &staged_in,
                    &job.source_path,
                    self.transfer_progress(&job.id),
                    cancel,
                )
                .await?;

            self.set_status(&job.id, JobStatus::Transcoding).await?;
            let duration = self.source_duration(local.as_ref(), &staged_in_str).await;
            let config = self
                .transcode(
                    job,
                    worker,
                    local.as_ref(),
                    &staged_in_str,
                    &staged_out_str,
                    duration,
                    cancel,
                )
                .await?;
            let size = self
                .verify(&job.id, local.as_ref(), &staged_out_str, duration)
                .await?;

            check_cancel(cancel)?;
            self.set_status(&job.id, JobStatus::Transferring).await?;
            self.engine
                .transfer(
                    &origin,
                    Direction::Upload,
                    &staged_out,
                    &remote_target,
                    self.transfer_progress(&job.id),
                    cancel,
                )
                .await?;

            let final_output = if job.is_manual {
                remote_target.clone()
            } else {
                self.set_status(&job.id, JobStatus::Replacing).await?;
                replace_remote(
                    origin.as_ref(),
                    &job.source_path,
                    &remote_target,
                    &config.container,
                )
                .await?
            };
            self.complete(&job.id, worker, final_output, size).await
        }
        .await;

        for path in [&staged_in, &staged_out] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "could not remove staged file");
                }
            }
        }
        result
    }

    /// `ssh_transfer`: the source is staged in the worker's scratch directory and the
    /// result is fetched back once verified on the worker.
    async fn run_ssh_transfer(
        &self,
        job: &Job,
        worker: &Worker,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let host = self.transports.for_worker(worker)?;
        let origin = self.transports.origin();
        let source_is_local = tokio::fs::metadata(&job.source_path).await.is_ok();

        let source_size = if source_is_local {
            tokio::fs::metadata(&job.source_path).await.ok().map(|m| m.len())
        } else if let Some(origin) = &origin {
            origin.file_size(&job.source_path).await?
        } else {
            None
        };
        let Some(source_size) = source_size else {
            return Err(JobError::SourceNotAccessible(job.source_path.clone()));
        };

        let remote_in = worker.scratch_path(&job.id, &job.source_path);
        let target = if job.is_manual {
            job.output_path
                .clone()
                .unwrap_or_else(|| manual_output_path(&job.source_path, &job.config.container))
        } else {
            self.encoder.output_path(&job.config, &job.source_path)
        };
        let remote_out = worker.scratch_path(&job.id, &target);
        self.store
            .update_job(&job.id, &mut |j: &mut Job| {
                j.source_size = Some(source_size);
                j.worker_input_path = Some(remote_in.clone());
                j.worker_output_path = Some(remote_out.clone());
            })
            .await?;

        let mut fetched_locally = false;
        let result: Result<(), JobError> = async {
            check_cancel(cancel)?;
            let prestaged = job.source_prestaged
                && job.worker_input_path.as_deref() == Some(remote_in.as_str())
                && host.file_size(&remote_in).await? == Some(source_size);
            if prestaged {
                info!(job_id = %job.id, path = %remote_in, "source already staged on worker");
            } else {
                stage_source(
                    &self.engine,
                    &host,
                    origin.as_ref(),
                    &job.source_path,
                    &remote_in,
                    self.transfer_progress(&job.id),
                    cancel,
                )
                .await?;
            }

            self.set_status(&job.id, JobStatus::Transcoding).await?;
            let duration = self.source_duration(host.as_ref(), &remote_in).await;
            let config = self
                .transcode(job, worker, host.as_ref(), &remote_in, &remote_out, duration, cancel)
                .await?;
            let size = self
                .verify(&job.id, host.as_ref(), &remote_out, duration)
                .await?;

            check_cancel(cancel)?;
            self.set_status(&job.id, JobStatus::Transferring).await?;
            let final_output = if source_is_local {
                fetched_locally = true;
                self.engine
                    .transfer(
                        &host,
                        Direction::Download,
                        Path::new(&target),
                        &remote_out,
                        self.transfer_progress(&job.id),
                        cancel,
                    )
                    .await?;
                if job.is_manual {
                    target.clone()
                } else {
                    self.set_status(&job.id, JobStatus::Replacing).await?;
                    replace_local(
                        Path::new(&job.source_path),
                        Path::new(&target),
                        &config.container,
                    )
                    .await?
                    .to_string_lossy()
                    .into_owned()
                }
            } else {
                let origin = origin.as_ref().ok_or_else(|| {
                    JobError::SourceNotAccessible(job.source_path.clone())
                })?;
                self.engine
                    .relay(
                        &host,
                        &remote_out,
                        origin,
                        &target,
                        self.transfer_progress(&job.id),
                        cancel,
                    )
                    .await?;
                if job.is_manual {
                    target.clone()
                } else {
                    self.set_status(&job.id, JobStatus::Replacing).await?;
                    replace_remote(origin.as_ref(), &job.source_path, &target, &config.container)
                        .await?
                }
            };
            self.complete(&job.id, worker, final_output, size).await
        }
        .await;

        remove_quietly(host.as_ref(), &remote_in).await;
        remove_quietly(host.as_ref(), &remote_out).await;
        if result.is_err() && fetched_locally {
            if let Err(e) = tokio::fs::remove_file(&target).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %target, error = %e, "could not remove partial download");
                }
            }
        }
        result
    }
}

async fn remove_quietly(host: &dyn Transport, path: &str) {
    if let Err(e) = host.remove_file(path).await {
        debug!(host = %host.describe(), path, error = %e, "could not remove scratch file");
    }
}

#[cfg(all(test, unix))]
mod tests;
