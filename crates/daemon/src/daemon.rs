//! Daemon startup and main loop.
//!
//! The daemon owns the record store and every background loop: dequeue and dispatch,
//! cancellation sync, prefetching, health checks and the stuck sweep. Pipelines run as
//! spawned tasks tracked in a [`CancelRegistry`] keyed by job id.

use crate::assign::WorkerScheduler;
use crate::cancel::{CancelReason, CancelRegistry};
use crate::config::{Config, ConfigError};
use crate::encode::{EncoderInvocation, FfmpegInvocation};
use crate::error::JobError;
use crate::events::{BroadcastSink, FanoutSink, JobEvent, SharedSink, TracingSink};
use crate::executor::{ExecutorSettings, JobExecutor};
use crate::health::HealthMonitor;
use crate::jobs::{current_timestamp_ms, Job, JobId, TransferMode};
use crate::metrics::{self, new_shared_metrics, SharedMetrics};
use crate::metrics_server::{run_metrics_server, ServerError};
use crate::prefetch::Prefetcher;
use crate::probe::{FfprobeProbe, MediaProbe};
use crate::recovery::{handle_failure, recover_after_crash, sweep_stuck, CrashRecoveryReport};
use crate::startup::StartupError;
use crate::store::{JsonFileStore, RecordStore, StoreError};
use crate::transfer::{TransferEngine, TransferSettings};
use crate::transport::{DefaultTransportFactory, TransportFactory};
use crate::workers::Worker;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

pub struct Daemon {
    pub config: Config,
    store: Arc<dyn RecordStore>,
    events: SharedSink,
    broadcast: BroadcastSink,
    scheduler: WorkerScheduler,
    executor: JobExecutor,
    prefetcher: Prefetcher,
    health: HealthMonitor,
    metrics: SharedMetrics,
    pipelines: CancelRegistry,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build a daemon on the JSON store in `paths.state_dir`, ffmpeg and ffprobe from
    /// `[encoder]` and SSH transports for remote hosts.
    pub fn from_config(config: Config) -> Result<Self, DaemonError> {
        let store = Arc::new(JsonFileStore::open(&config.paths.state_dir)?);
        let transports = Arc::new(DefaultTransportFactory::new(config.origin.ssh.clone()));
        let encoder = Arc::new(FfmpegInvocation::new(
            config.encoder.ffmpeg_path.clone(),
            config.encoder.output_tag.clone(),
        ));
        let probe = Arc::new(FfprobeProbe::new(config.encoder.ffprobe_path.clone()));
        Ok(Self::with_parts(config, store, transports, encoder, probe))
    }

    /// Build a daemon from explicit collaborators.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn RecordStore>,
        transports: Arc<dyn TransportFactory>,
        encoder: Arc<dyn EncoderInvocation>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        let broadcast = BroadcastSink::new(EVENT_CHANNEL_CAPACITY);
        let events: SharedSink = Arc::new(FanoutSink::new(vec![
            Arc::new(TracingSink),
            Arc::new(broadcast.clone()),
        ]));
        let engine = TransferEngine::new(TransferSettings::from(&config.transfer));
        let settings = ExecutorSettings {
            staging_dir: config.paths.staging_dir.clone(),
            validation: config.validation.clone(),
            backoff_minutes: config.recovery.backoff_minutes.clone(),
            stuck_timeout_minutes: config.scheduler.stuck_timeout_minutes,
        };
        let executor = JobExecutor::new(
            store.clone(),
            events.clone(),
            transports.clone(),
            encoder,
            probe,
            engine.clone(),
            settings,
        );
        let prefetcher = Prefetcher::new(
            store.clone(),
            transports.clone(),
            engine,
            events.clone(),
        );
        let health = HealthMonitor::new(
            store.clone(),
            transports.clone(),
            events.clone(),
            config.health.auto_disable_threshold,
        );
        let scheduler = WorkerScheduler::new(
            transports.origin().is_some(),
            config.scheduler.auto_hardware_upgrade,
        );

        Self {
            config,
            store,
            events,
            broadcast,
            scheduler,
            executor,
            prefetcher,
            health,
            metrics: new_shared_metrics(),
            pipelines: CancelRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Live job and worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.broadcast.subscribe()
    }

    /// Cancelling this token stops [`Daemon::run`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn running_pipelines(&self) -> Vec<JobId> {
        self.pipelines.job_ids()
    }

    /// Upsert configured workers. Configured fields win; status and failure counters
    /// already in the store are kept.
    pub async fn seed_workers(&self) -> Result<(), StoreError> {
        for cfg in &self.config.workers {
            let mut worker = Worker::from(cfg);
            if let Some(existing) = self.store.get_worker(&worker.id).await? {
                if !worker.is_local {
                    worker.status = existing.status;
                }
                worker.consecutive_failures = existing.consecutive_failures;
            }
            self.store.upsert_worker(&worker).await?;
            debug!(worker_id = %worker.id, local = worker.is_local, "worker registered");
        }
        Ok(())
    }

    /// Seed workers and recover from an unclean shutdown.
    pub async fn startup(&self) -> Result<CrashRecoveryReport, DaemonError> {
        self.seed_workers().await?;
        let report = recover_after_crash(self.store.as_ref(), &self.config.paths.staging_dir).await?;
        Ok(report)
    }

    /// One pass over the queue. Returns the jobs handed to pipelines.
    ///
    /// A job whose worker is at capacity keeps its assignment and stays queued, which makes
    /// it a prefetch candidate for that worker.
    pub async fn dequeue_once(&self) -> Result<Vec<JobId>, StoreError> {
        let now = current_timestamp_ms();
        let workers = self.store.list_workers().await?;
        let mut counts = self.store.active_counts().await?;
        let mut dispatched = Vec::new();

        for mut job in self.store.queued_jobs().await? {
            if !job.is_due(now)
                || self.pipelines.contains(&job.id)
                || self.prefetcher.is_prefetching(&job.id)
            {
                continue;
            }

            if let Some(assigned) = job.assigned_worker_id.clone() {
                let usable = workers
                    .iter()
                    .any(|w| w.id == assigned && w.is_available());
                if !usable {
                    info!(job_id = %job.id, worker_id = %assigned, "assigned worker unavailable, reassigning");
                    job = self
                        .store
                        .update_job(&job.id, &mut |j: &mut Job| j.clear_assignment())
                        .await?;
                }
            }

            let Some(assignment) = self.scheduler.assign(
                &job,
                &workers,
                &counts,
                job.assigned_worker_id.as_deref(),
            ) else {
                debug!(job_id = %job.id, "no worker available");
                continue;
            };
            let Some(worker) = workers.iter().find(|w| w.id == assignment.worker_id) else {
                continue;
            };

            let unchanged = job.assigned_worker_id.as_deref() == Some(worker.id.as_str())
                && job.transfer_mode == Some(assignment.mode)
                && assignment.upgraded_config.is_none();
            if !unchanged {
                let keep_staged = job.source_prestaged
                    && job.assigned_worker_id.as_deref() == Some(worker.id.as_str())
                    && assignment.mode == TransferMode::SshTransfer;
                job = self
                    .store
                    .update_job(&job.id, &mut |j: &mut Job| {
                        let staged = j.worker_input_path.clone();
                        assignment.apply(j);
                        if keep_staged {
                            j.worker_input_path = staged.clone();
                        } else {
                            j.source_prestaged = false;
                        }
                    })
                    .await?;
            }

            let active = counts.get(&worker.id).copied().unwrap_or(0);
            if active >= worker.max_concurrent_jobs {
                debug!(job_id = %job.id, worker_id = %worker.id, active, "worker busy, job waits");
                continue;
            }
            // active in the store before the pipeline starts, so capacity counts see it
            let first = assignment.mode.first_status();
            job = self
                .store
                .update_job(&job.id, &mut |j: &mut Job| j.set_status(first))
                .await?;
            *counts.entry(worker.id.clone()).or_insert(0) += 1;
            dispatched.push(job.id.clone());
            self.spawn_pipeline(job, worker.clone());
        }
        Ok(dispatched)
    }

    fn spawn_pipeline(&self, job: Job, worker: Worker) {
        let handle = self.pipelines.register(&job.id);
        let executor = self.executor.clone();
        let pipelines = self.pipelines.clone();
        info!(job_id = %job.id, worker_id = %worker.id, mode = ?job.transfer_mode, "dispatching job");

        tokio::spawn(async move {
            let job_id = job.id.clone();
            match executor.run(job, worker, handle).await {
                Ok(outcome) => debug!(%job_id, ?outcome, "pipeline finished"),
                Err(e) => error!(%job_id, error = %e, "could not record job outcome"),
            }
            pipelines.remove(&job_id);
        });
    }

    /// Act on `cancel_requested` flags set by operators, in-process or through the store.
    pub async fn sync_cancellations(&self) -> Result<Vec<JobId>, StoreError> {
        let mut cancelled = Vec::new();
        for job in self.store.list_jobs().await? {
            if !job.cancel_requested || job.is_terminal() {
                continue;
            }
            if self.pipelines.cancel(&job.id, CancelReason::Operator) {
                // the pipeline records the outcome itself
                continue;
            }
            self.prefetcher.cancel(&job.id);
            handle_failure(
                self.store.as_ref(),
                self.events.as_ref(),
                &job.id,
                &JobError::Cancelled,
                &self.config.recovery.backoff_minutes,
            )
            .await?;
            cancelled.push(job.id);
        }
        Ok(cancelled)
    }

    /// Flag a job for cancellation and act on it right away.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), StoreError> {
        self.store
            .update_job(job_id, &mut |j: &mut Job| j.cancel_requested = true)
            .await?;
        self.sync_cancellations().await?;
        Ok(())
    }

    pub async fn sweep_stuck(&self) -> Result<Vec<JobId>, StoreError> {
        let timeout = Duration::from_secs(self.config.scheduler.stuck_timeout_minutes * 60);
        sweep_stuck(
            self.store.as_ref(),
            self.events.as_ref(),
            &self.pipelines,
            timeout,
            &self.config.recovery.backoff_minutes,
        )
        .await
    }

    /// Health round followed by a metrics refresh.
    pub async fn check_health(&self) -> Result<(), StoreError> {
        let report = self.health.check_all().await?;
        debug!(online = report.online.len(), offline = report.offline.len(), "health round");
        metrics::refresh(&self.metrics, self.store.as_ref(), &self.health).await
    }

    async fn poll(&self) {
        if let Err(e) = self.sync_cancellations().await {
            warn!(error = %e, "cancellation sync failed");
        }
        match self.dequeue_once().await {
            Ok(ids) if !ids.is_empty() => debug!(count = ids.len(), "dispatched jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "dequeue failed"),
        }
        if let Err(e) = self.prefetcher.tick().await {
            warn!(error = %e, "prefetch tick failed");
        }
    }

    /// Run until the shutdown token fires or ctrl-c arrives.
    ///
    /// Pipelines still running at shutdown are not cancelled; the next start re-queues them.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.startup().await?;
        self.check_health().await?;

        let metrics = self.metrics.clone();
        let addr = self.config.scheduler.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &addr).await {
                error!(error = %e, "metrics server stopped");
            }
        });

        let mut poll = tokio::time::interval(Duration::from_millis(
            self.config.scheduler.poll_interval_ms.max(1),
        ));
        let mut health =
            tokio::time::interval(Duration::from_secs(self.config.health.interval_secs.max(1)));
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.scheduler.stuck_sweep_interval_secs.max(1),
        ));
        for ticker in [&mut poll, &mut health, &mut sweep] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        info!(
            workers = self.config.workers.len(),
            poll_ms = self.config.scheduler.poll_interval_ms,
            "daemon running"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
                _ = poll.tick() => self.poll().await,
                _ = health.tick() => {
                    if let Err(e) = self.check_health().await {
                        warn!(error = %e, "health round failed");
                    }
                }
                _ = sweep.tick() => match self.sweep_stuck().await {
                    Ok(ids) if !ids.is_empty() => warn!(count = ids.len(), "swept stuck jobs"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "stuck sweep failed"),
                },
            }
        }

        self.prefetcher.cancel_all();
        info!(running = self.pipelines.len(), "daemon stopping");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::encode::{EncodeConfig, VideoCodec};
    use crate::jobs::{create_job, JobStatus};
    use crate::probe::{FormatInfo, ProbeError, ProbeResult, VideoStream};
    use crate::store::MemoryStore;
    use crate::transport::{LocalTransport, Transport, TransportError};
    use crate::workers::WorkerStatus;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct LocalHosts;

    impl TransportFactory for LocalHosts {
        fn for_worker(&self, _worker: &Worker) -> Result<Arc<dyn Transport>, TransportError> {
            Ok(Arc::new(LocalTransport))
        }
        fn origin(&self) -> Option<Arc<dyn Transport>> {
            None
        }
        fn local(&self) -> Arc<dyn Transport> {
            Arc::new(LocalTransport)
        }
    }

    /// Any existing file is a one-stream HEVC video of unknown duration.
    struct AnyVideo;

    #[async_trait]
    impl MediaProbe for AnyVideo {
        async fn probe(&self, _host: &dyn Transport, path: &str) -> Result<ProbeResult, ProbeError> {
            let size = std::fs::metadata(path)
                .map_err(|e| ProbeError::FfprobeFailed(e.to_string()))?
                .len();
            Ok(ProbeResult {
                video_streams: vec![VideoStream {
                    codec_name: "hevc".into(),
                    width: 1280,
                    height: 720,
                    bitrate_kbps: None,
                }],
                audio_streams: vec![],
                format: FormatInfo {
                    duration_secs: 0.0,
                    size_bytes: size,
                },
            })
        }
    }

    const CONFIG: &str = r#"
[validation]
min_output_bytes = 1

[[workers]]
id = "local"
is_local = true
max_concurrent_jobs = 1

[[workers]]
id = "remote"
max_concurrent_jobs = 1
[workers.host]
hostname = "10.0.0.9"
"#;

    fn daemon(dir: &TempDir, store: Arc<MemoryStore>) -> Daemon {
        daemon_with_ffmpeg(
            dir,
            store,
            "#!/bin/sh\nfor last; do :; done\nprintf 'encoded-output' > \"$last\"\n",
        )
    }

    fn daemon_with_ffmpeg(dir: &TempDir, store: Arc<MemoryStore>, script: &str) -> Daemon {
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(&ffmpeg, script).unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::parse_toml(CONFIG).unwrap();
        config.paths.staging_dir = dir.path().join("staging");
        Daemon::with_parts(
            config,
            store,
            Arc::new(LocalHosts),
            Arc::new(FfmpegInvocation::new(ffmpeg.to_string_lossy().into_owned(), "fleetcode")),
            Arc::new(AnyVideo),
        )
    }

    async fn wait_for(store: &MemoryStore, id: &str, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = store.get_job(id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", id, status);
    }

    async fn wait_until(store: &MemoryStore, id: &str, done: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..500 {
            let job = store.get_job(id).await.unwrap().unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached the expected state", id);
    }

    #[tokio::test]
    async fn test_retry_after_software_fallback_is_not_upgraded_again() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let calls = dir.path().join("calls.log");
        let marker = dir.path().join("x265-failed-once");
        // nvenc always fails with a driver error, libx265 fails on its first run only
        let script = format!(
            "#!/bin/sh\n\
             echo \"$*\" >> '{calls}'\n\
             for last; do :; done\n\
             case \"$*\" in *nvenc*) echo 'CUDA_ERROR_NO_DEVICE'; exit 1;; esac\n\
             if [ ! -f '{marker}' ]; then touch '{marker}'; echo 'x265 crashed'; exit 1; fi\n\
             printf 'encoded-output' > \"$last\"\n",
            calls = calls.display(),
            marker = marker.display(),
        );
        let d = daemon_with_ffmpeg(&dir, store.clone(), &script);
        d.startup().await.unwrap();
        store
            .update_worker("local", &mut |w: &mut Worker| {
                w.hardware.insert(crate::workers::HardwareFamily::Nvenc);
            })
            .await
            .unwrap();

        let source = dir.path().join("movie.mkv");
        std::fs::write(&source, b"source-bytes").unwrap();
        let job = create_job(source.to_str().unwrap(), EncodeConfig::default(), None, 0, 3);
        store.insert_job(&job).await.unwrap();

        // first attempt: upgraded to nvenc, falls back to libx265, which fails too
        assert_eq!(d.dequeue_once().await.unwrap(), vec![job.id.clone()]);
        let retried = wait_until(&store, &job.id, |j| {
            j.retry_count == 1 && j.status == JobStatus::Queued
        })
        .await;
        assert_eq!(retried.config.video_codec, VideoCodec::Libx265);
        assert!(retried.hw_fallback_applied);
        for _ in 0..500 {
            if d.running_pipelines().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        store
            .update_job(&job.id, &mut |j: &mut Job| j.scheduled_after = None)
            .await
            .unwrap();
        assert_eq!(d.dequeue_once().await.unwrap(), vec![job.id.clone()]);
        let done = wait_for(&store, &job.id, JobStatus::Completed).await;
        assert_eq!(done.config.video_codec, VideoCodec::Libx265);

        let log = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(log.lines().filter(|l| l.contains("nvenc")).count(), 1);
        assert_eq!(log.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_seed_workers_keeps_runtime_state() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());

        d.seed_workers().await.unwrap();
        store
            .update_worker("remote", &mut |w: &mut Worker| {
                w.status = WorkerStatus::Online;
                w.consecutive_failures = 2;
            })
            .await
            .unwrap();
        d.seed_workers().await.unwrap();

        let remote = store.get_worker("remote").await.unwrap().unwrap();
        assert_eq!(remote.status, WorkerStatus::Online);
        assert_eq!(remote.consecutive_failures, 2);
        let local = store.get_worker("local").await.unwrap().unwrap();
        assert_eq!(local.status, WorkerStatus::Online);
        assert_eq!(store.list_workers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_runs_job_to_completion() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());
        d.startup().await.unwrap();

        let source = dir.path().join("movie.mkv");
        std::fs::write(&source, b"source-bytes").unwrap();
        let job = create_job(source.to_str().unwrap(), EncodeConfig::default(), None, 0, 3);
        store.insert_job(&job).await.unwrap();

        let dispatched = d.dequeue_once().await.unwrap();
        assert_eq!(dispatched, vec![job.id.clone()]);
        // a job with a live pipeline is not dispatched twice
        assert!(d.dequeue_once().await.unwrap().is_empty());

        let done = wait_for(&store, &job.id, JobStatus::Completed).await;
        assert_eq!(done.assigned_worker_id.as_deref(), Some("local"));
        assert_eq!(done.transfer_mode, Some(TransferMode::Local));
        assert_eq!(std::fs::read(&source).unwrap(), b"encoded-output");
    }

    #[tokio::test]
    async fn test_dispatched_job_counts_against_capacity_immediately() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon_with_ffmpeg(
            &dir,
            store.clone(),
            "#!/bin/sh\nsleep 5\nfor last; do :; done\nprintf 'encoded-output' > \"$last\"\n",
        );
        d.seed_workers().await.unwrap();

        let mut ids = Vec::new();
        for name in ["first.mkv", "second.mkv"] {
            let source = dir.path().join(name);
            std::fs::write(&source, b"source-bytes").unwrap();
            let job = create_job(source.to_str().unwrap(), EncodeConfig::default(), None, 0, 3);
            store.insert_job(&job).await.unwrap();
            ids.push(job.id);
        }

        let dispatched = d.dequeue_once().await.unwrap();
        assert_eq!(dispatched.len(), 1);
        let running = store.get_job(&dispatched[0]).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Transcoding);
        assert_eq!(store.count_active_jobs("local").await.unwrap(), 1);

        // the local worker takes one job at a time
        assert!(d.dequeue_once().await.unwrap().is_empty());
        let waiting = ids.iter().find(|id| **id != dispatched[0]).unwrap();
        let waiting = store.get_job(waiting).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_job_for_busy_worker_keeps_assignment() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());
        d.seed_workers().await.unwrap();

        let mut running = create_job("/media/running.mkv", EncodeConfig::default(), None, 0, 3);
        running.status = JobStatus::Transcoding;
        running.assigned_worker_id = Some("local".into());
        store.insert_job(&running).await.unwrap();
        let waiting = create_job("/media/next.mkv", EncodeConfig::default(), None, 0, 3);
        store.insert_job(&waiting).await.unwrap();

        // the remote worker is offline, so the local one is the only candidate
        assert!(d.dequeue_once().await.unwrap().is_empty());
        let stored = store.get_job(&waiting.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_unavailable_assigned_worker_is_dropped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());
        d.seed_workers().await.unwrap();
        store
            .update_worker("local", &mut |w: &mut Worker| w.is_enabled = false)
            .await
            .unwrap();

        let mut job = create_job("/media/a.mkv", EncodeConfig::default(), None, 0, 3);
        job.assigned_worker_id = Some("local".into());
        job.transfer_mode = Some(TransferMode::Local);
        store.insert_job(&job).await.unwrap();

        assert!(d.dequeue_once().await.unwrap().is_empty());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_worker_id, None);
        assert_eq!(stored.transfer_mode, None);
    }

    #[tokio::test]
    async fn test_deferred_job_is_not_dispatched() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());
        d.seed_workers().await.unwrap();

        let mut job = create_job("/media/a.mkv", EncodeConfig::default(), None, 0, 3);
        job.scheduled_after = Some(current_timestamp_ms() + 60_000);
        store.insert_job(&job).await.unwrap();

        assert!(d.dequeue_once().await.unwrap().is_empty());
        assert!(d.running_pipelines().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());
        let mut events = d.subscribe();

        let job = create_job("/media/a.mkv", EncodeConfig::default(), None, 0, 3);
        store.insert_job(&job).await.unwrap();
        d.cancel_job(&job.id).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(
            events.try_recv().unwrap(),
            JobEvent::Cancelled { job_id: job.id.clone() }
        );
        assert!(store.job_logs().await.unwrap().is_empty());

        // already terminal, nothing more to do
        assert!(d.sync_cancellations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_startup_requeues_interrupted_jobs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let d = daemon(&dir, store.clone());

        let mut job = create_job("/media/a.mkv", EncodeConfig::default(), None, 0, 3);
        job.status = JobStatus::Transcoding;
        job.assigned_worker_id = Some("local".into());
        store.insert_job(&job).await.unwrap();

        let report = d.startup().await.unwrap();
        assert_eq!(report.requeued, vec![job.id.clone()]);
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut d = daemon(&dir, store);
        d.config.scheduler.metrics_addr = "127.0.0.1:0".into();
        let token = d.shutdown_token();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), d.run())
            .await
            .unwrap()
            .unwrap();
    }
}
