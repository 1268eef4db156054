//! The transcoding leg and its hardware fallback ladder.

use super::{check_cancel, JobExecutor};
use crate::encode::{is_hardware_failure, parse_progress_line, EncodeConfig, LogTail, ProgressUpdate};
use crate::error::JobError;
use crate::events::JobEvent;
use crate::jobs::Job;
use crate::transport::{Transport, TransportError};
use crate::workers::Worker;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often encoder telemetry is written back to the job record.
const TELEMETRY_FLUSH: Duration = Duration::from_secs(2);

impl JobExecutor {
    /// Encode `input` into `output` on `host`, walking the fallback ladder on failure.
    ///
    /// On a worker that has the codec's hardware family:
    /// 1. with hardware decode configured, retry once with software decode
    /// 2. then, or straight away on a known driver error, switch to the software codec
    ///
    /// Returns the configuration that produced the output.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn transcode(
        &self,
        job: &Job,
        worker: &Worker,
        host: &dyn Transport,
        input: &str,
        output: &str,
        duration: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<EncodeConfig, JobError> {
        let mut config = job.config.clone();
        let first = self
            .encode_once(&job.id, host, &config, input, output, duration, cancel)
            .await;
        let failure = match first {
            Ok(()) => return Ok(config),
            Err(e @ JobError::EncodeFailed { .. }) => e,
            Err(e) => return Err(e),
        };

        let on_hardware = config
            .video_codec
            .hardware_family()
            .map_or(false, |family| worker.has_hardware(family));
        if !on_hardware {
            return Err(failure);
        }

        if config.hw_accel.is_some() {
            config = config.with_software_decode();
            self.fallback(
                &job.id,
                &config,
                false,
                format!(
                    "{} with hardware decode failed, retrying with software decode",
                    config.video_codec
                ),
            )
            .await?;
            match self
                .encode_once(&job.id, host, &config, input, output, duration, cancel)
                .await
            {
                Ok(()) => return Ok(config),
                Err(JobError::EncodeFailed { .. }) => {}
                Err(e) => return Err(e),
            }
        } else if !is_hardware_failure(&failure.log_tail().join("\n")) {
            return Err(failure);
        }

        let software = config.with_software_encoder();
        self.fallback(
            &job.id,
            &software,
            true,
            format!(
                "hardware encoder {} failed, falling back to {}",
                config.video_codec, software.video_codec
            ),
        )
        .await?;
        self.encode_once(&job.id, host, &software, input, output, duration, cancel)
            .await?;
        Ok(software)
    }

    /// Persist the next configuration, reset telemetry and tell operators about it.
    async fn fallback(
        &self,
        job_id: &str,
        next: &EncodeConfig,
        software_encoder: bool,
        message: String,
    ) -> Result<(), JobError> {
        warn!(job_id, codec = %next.video_codec, "{}", message);
        self.store
            .update_job(job_id, &mut |j: &mut Job| {
                j.config = next.clone();
                j.hw_fallback_applied |= software_encoder;
                j.clear_telemetry();
            })
            .await?;
        self.events.emit(JobEvent::Log {
            job_id: job_id.to_string(),
            message,
        });
        Ok(())
    }

    /// One encoder run with streamed progress.
    #[allow(clippy::too_many_arguments)]
    async fn encode_once(
        &self,
        job_id: &str,
        host: &dyn Transport,
        config: &EncodeConfig,
        input: &str,
        output: &str,
        duration: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        check_cancel(cancel)?;
        let command = self.encoder.build(config, input, Some(output));
        let shell = command.to_shell();
        debug!(job_id, host = %host.describe(), command = %shell, "running encoder");

        let (progress_tx, mut progress_rx) = watch::channel(ProgressUpdate::default());
        let mut tail = LogTail::default();

        let result = {
            let mut on_line = |line: &str| {
                if let Some(update) = parse_progress_line(line) {
                    progress_tx.send_replace(update);
                }
                tail.push(line);
            };
            let run = host.run_command_streaming(&shell, &mut on_line, cancel);
            tokio::pin!(run);
            let mut ticker = tokio::time::interval(TELEMETRY_FLUSH);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = ticker.tick() => {
                        if progress_rx.has_changed().unwrap_or(false) {
                            let update = progress_rx.borrow_and_update().clone();
                            self.record_progress(job_id, &update, duration).await?;
                        }
                    }
                }
            }
        };

        let output_status = match result {
            Ok(output) => output,
            Err(TransportError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => {
                return Err(JobError::EncodeFailed {
                    reason: e.to_string(),
                    log_tail: tail.to_vec(),
                })
            }
        };
        check_cancel(cancel)?;

        if !output_status.success() {
            let code = output_status
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(JobError::EncodeFailed {
                reason: format!("{} exited with status {}", command.program, code),
                log_tail: tail.to_vec(),
            });
        }

        let last = progress_rx.borrow().clone();
        self.record_progress(job_id, &last, duration).await?;
        Ok(())
    }

    async fn record_progress(
        &self,
        job_id: &str,
        update: &ProgressUpdate,
        duration: Option<f64>,
    ) -> Result<(), JobError> {
        let percent = update.percent(duration);
        let eta = update.eta_secs(duration);
        self.store
            .update_job(job_id, &mut |j: &mut Job| {
                j.progress_percent = percent;
                j.current_fps = update.fps;
                j.eta_seconds = eta;
                j.checkpoint_frame = update.frame;
            })
            .await?;
        self.events.emit(JobEvent::Progress {
            job_id: job_id.to_string(),
            percent,
            fps: update.fps,
            eta_seconds: eta,
        });
        Ok(())
    }
}
