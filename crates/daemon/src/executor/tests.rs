use super::*;
use crate::cancel::CancelRegistry;
use crate::encode::{EncodeConfig, FfmpegInvocation, HwAccel, VideoCodec};
use crate::events::testing::RecordingSink;
use crate::jobs::{create_job, create_manual_job};
use crate::probe::{FormatInfo, ProbeError, ProbeResult, VideoStream};
use crate::store::MemoryStore;
use crate::transport::{LocalTransport, TransportError};
use crate::workers::{test_worker, HardwareFamily};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in ffmpeg: NVENC always fails with a driver error, inputs named `slow` hang, and
/// everything else writes a small output. Each call appends the first bytes of its input
/// to `calls`.
const FAKE_FFMPEG: &str = r#"#!/bin/sh
prev=""
for a; do
  if [ "$prev" = "-i" ]; then input="$a"; fi
  prev="$a"
done
out="$a"
head -c 4 "$input" >> "$(dirname "$0")/calls"
echo >> "$(dirname "$0")/calls"
case "$*" in
  *_nvenc*) echo "[hevc_nvenc @ 0x55] OpenEncodeSessionEx failed: no CUDA-capable device"; exit 1 ;;
esac
case "$input" in
  *slow*) sleep 30 ;;
esac
echo "frame=  240 fps= 48 q=28.0 size=    2048kB time=00:00:10.00 bitrate=1677.7kbits/s speed=2.00x"
printf 'encoded-output' > "$out"
exit 0
"#;

/// Source files report `source_secs`, anything the fake encoder wrote reports `output_secs`.
struct FakeProbe {
    source_secs: f64,
    output_secs: f64,
}

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, _host: &dyn Transport, path: &str) -> Result<ProbeResult, ProbeError> {
        let content =
            std::fs::read(path).map_err(|e| ProbeError::FfprobeFailed(e.to_string()))?;
        let duration = if content.starts_with(b"encoded") {
            self.output_secs
        } else {
            self.source_secs
        };
        Ok(ProbeResult {
            video_streams: vec![VideoStream {
                codec_name: "hevc".into(),
                width: 1920,
                height: 1080,
                bitrate_kbps: None,
            }],
            audio_streams: vec![],
            format: FormatInfo {
                duration_secs: duration,
                size_bytes: content.len() as u64,
            },
        })
    }
}

/// Every host is this machine; the origin exists only when asked for.
struct Hosts {
    with_origin: bool,
}

impl TransportFactory for Hosts {
    fn for_worker(&self, _worker: &Worker) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(LocalTransport))
    }

    fn origin(&self) -> Option<Arc<dyn Transport>> {
        self.with_origin
            .then(|| Arc::new(LocalTransport) as Arc<dyn Transport>)
    }

    fn local(&self) -> Arc<dyn Transport> {
        Arc::new(LocalTransport)
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    executor: JobExecutor,
    cancels: CancelRegistry,
}

impl Fixture {
    fn new(with_origin: bool, output_secs: f64) -> Self {
        let dir = TempDir::new().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(&ffmpeg, FAKE_FFMPEG).unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let settings = ExecutorSettings {
            staging_dir: dir.path().join("staging"),
            validation: ValidationConfig {
                min_output_bytes: 1,
                duration_tolerance_secs: 2.0,
            },
            backoff_minutes: vec![1, 5, 15],
            stuck_timeout_minutes: 30,
        };
        let executor = JobExecutor::new(
            store.clone(),
            sink.clone(),
            Arc::new(Hosts { with_origin }),
            Arc::new(FfmpegInvocation::new(
                ffmpeg.to_string_lossy().into_owned(),
                "fleetcode",
            )),
            Arc::new(FakeProbe {
                source_secs: 10.0,
                output_secs,
            }),
            TransferEngine::default(),
            settings,
        );
        Self {
            dir,
            store,
            sink,
            executor,
            cancels: CancelRegistry::new(),
        }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    fn media(&self, name: &str, content: &[u8]) -> String {
        let path = self.path(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn dispatch(&self, mut job: Job, worker: &Worker, mode: TransferMode) -> Job {
        job.assigned_worker_id = Some(worker.id.clone());
        job.transfer_mode = Some(mode);
        if matches!(mode, TransferMode::Local | TransferMode::Mapped) {
            job.worker_input_path = Some(job.source_path.clone());
        }
        self.store.insert_job(&job).await.unwrap();
        job
    }

    async fn run(&self, job: &Job, worker: &Worker) -> RunOutcome {
        let handle = self.cancels.register(&job.id);
        let outcome = self
            .executor
            .run(job.clone(), worker.clone(), handle)
            .await
            .unwrap();
        self.cancels.remove(&job.id);
        outcome
    }

    async fn stored(&self, id: &str) -> Job {
        self.store.get_job(id).await.unwrap().unwrap()
    }
}

fn gpu_worker() -> Worker {
    let mut worker = test_worker("gpu", true);
    worker.hardware.insert(HardwareFamily::Nvenc);
    worker
}

#[tokio::test]
async fn test_hardware_failure_falls_back_to_software_encoder() {
    let fx = Fixture::new(false, 10.0);
    let source = fx.media("movie.mkv", b"source-bytes");
    let config = EncodeConfig {
        video_codec: VideoCodec::HevcNvenc,
        hw_accel: Some(HwAccel::Cuda),
        encoder_tune: Some("hq".into()),
        ..EncodeConfig::default()
    };
    let worker = gpu_worker();
    let job = fx
        .dispatch(create_job(&source, config, None, 0, 3), &worker, TransferMode::Local)
        .await;

    let outcome = fx.run(&job, &worker).await;

    assert_eq!(outcome, RunOutcome::Completed);
    let stored = fx.stored(&job.id).await;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.validation_status, Some(ValidationStatus::Passed));
    assert_eq!(stored.config.video_codec, VideoCodec::Libx265);
    assert_eq!(stored.config.hw_accel, None);
    assert_eq!(stored.config.encoder_tune, None);
    assert!(stored.hw_fallback_applied);
    assert_eq!(stored.output_path.as_deref(), Some(source.as_str()));
    assert_eq!(std::fs::read(&source).unwrap(), b"encoded-output");
    assert!(!std::path::Path::new(&format!("{}.original", source)).exists());

    // hardware decode, software decode, software encoder
    assert_eq!(fx.calls().len(), 3);
    let fallbacks = fx
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, JobEvent::Log { .. }))
        .count();
    assert_eq!(fallbacks, 2);
    assert_eq!(fx.store.job_logs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_hardware_codec_without_hardware_fails_without_fallback() {
    let fx = Fixture::new(false, 10.0);
    let source = fx.media("movie.mkv", b"source-bytes");
    let config = EncodeConfig {
        video_codec: VideoCodec::HevcNvenc,
        ..EncodeConfig::default()
    };
    let worker = test_worker("cpu", true);
    let job = fx
        .dispatch(create_job(&source, config, None, 0, 3), &worker, TransferMode::Local)
        .await;

    let outcome = fx.run(&job, &worker).await;

    assert!(matches!(
        outcome,
        RunOutcome::Recovered(FailureOutcome::Retrying { retry_count: 1, .. })
    ));
    assert_eq!(fx.calls().len(), 1);
    assert_eq!(std::fs::read(&source).unwrap(), b"source-bytes");
    let stored = fx.stored(&job.id).await;
    assert!(stored
        .log_tail
        .iter()
        .any(|l| l.contains("OpenEncodeSessionEx failed")));
}

#[tokio::test]
async fn test_manual_job_writes_sibling_and_keeps_source() {
    let fx = Fixture::new(false, 10.0);
    let source = fx.media("movie.mkv", b"source-bytes");
    let worker = test_worker("local", true);
    let job = fx
        .dispatch(
            create_manual_job(&source, EncodeConfig::default(), 0, 3),
            &worker,
            TransferMode::Local,
        )
        .await;

    assert_eq!(fx.run(&job, &worker).await, RunOutcome::Completed);

    let sibling = fx.path("movie V2.mkv");
    assert_eq!(std::fs::read(&sibling).unwrap(), b"encoded-output");
    assert_eq!(std::fs::read(&source).unwrap(), b"source-bytes");
    assert_eq!(fx.stored(&job.id).await.output_path, Some(sibling));
}

#[tokio::test]
async fn test_duration_mismatch_fails_validation_and_never_replaces() {
    let fx = Fixture::new(false, 4.0);
    let source = fx.media("movie.mkv", b"source-bytes");
    let worker = test_worker("local", true);
    let job = fx
        .dispatch(
            create_job(&source, EncodeConfig::default(), None, 0, 3),
            &worker,
            TransferMode::Local,
        )
        .await;

    let outcome = fx.run(&job, &worker).await;

    assert_eq!(outcome, RunOutcome::Recovered(FailureOutcome::Failed));
    let stored = fx.stored(&job.id).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.validation_status, Some(ValidationStatus::Failed));
    assert_eq!(stored.retry_count, 0);
    let visited_replacing = fx.sink.events().into_iter().any(|e| {
        matches!(e, JobEvent::StatusChanged { status: JobStatus::Replacing, .. })
    });
    assert!(!visited_replacing);
    assert_eq!(std::fs::read(&source).unwrap(), b"source-bytes");
    assert!(!std::path::Path::new(&fx.path("movie.fleetcode.mkv")).exists());
}

#[tokio::test]
async fn test_missing_source_is_terminal() {
    let fx = Fixture::new(false, 10.0);
    let worker = test_worker("local", true);
    let job = fx
        .dispatch(
            create_job(&fx.path("gone.mkv"), EncodeConfig::default(), None, 0, 3),
            &worker,
            TransferMode::Local,
        )
        .await;

    let outcome = fx.run(&job, &worker).await;

    assert_eq!(outcome, RunOutcome::Recovered(FailureOutcome::Failed));
    let stored = fx.stored(&job.id).await;
    assert!(stored
        .error_reason
        .unwrap()
        .starts_with("source not accessible"));
    assert!(fx.calls().is_empty());
}

#[tokio::test]
async fn test_ssh_transfer_uses_prestaged_source() {
    let fx = Fixture::new(false, 10.0);
    let source = fx.media("episode.mkv", b"AAAA-source");
    let mut worker = test_worker("remote", false);
    worker.working_directory = fx.path("scratch");
    std::fs::create_dir_all(&worker.working_directory).unwrap();

    let mut job = create_job(&source, EncodeConfig::default(), None, 0, 3);
    let staged = worker.scratch_path(&job.id, &source);
    // same size, different bytes: a re-upload would be visible to the encoder
    std::fs::write(&staged, b"BBBB-source").unwrap();
    job.source_prestaged = true;
    job.worker_input_path = Some(staged.clone());
    let job = fx.dispatch(job, &worker, TransferMode::SshTransfer).await;

    assert_eq!(fx.run(&job, &worker).await, RunOutcome::Completed);

    assert_eq!(fx.calls(), vec!["BBBB".to_string()]);
    assert_eq!(std::fs::read(&source).unwrap(), b"encoded-output");
    assert_eq!(std::fs::read_dir(&worker.working_directory).unwrap().count(), 0);
}

#[tokio::test]
async fn test_ssh_transfer_uploads_when_not_prestaged() {
    let fx = Fixture::new(false, 10.0);
    let source = fx.media("episode.mkv", b"AAAA-source");
    let mut worker = test_worker("remote", false);
    worker.working_directory = fx.path("scratch");
    let job = fx
        .dispatch(
            create_job(&source, EncodeConfig::default(), None, 0, 3),
            &worker,
            TransferMode::SshTransfer,
        )
        .await;

    assert_eq!(fx.run(&job, &worker).await, RunOutcome::Completed);

    assert_eq!(fx.calls(), vec!["AAAA".to_string()]);
    assert_eq!(std::fs::read(&source).unwrap(), b"encoded-output");
    let stored = fx.stored(&job.id).await;
    assert_eq!(
        stored.worker_input_path,
        Some(worker.scratch_path(&job.id, &source))
    );
}

#[tokio::test]
async fn test_ssh_pull_round_trip() {
    let fx = Fixture::new(true, 10.0);
    let source = fx.media("film.mp4", b"CCCC-source");
    let worker = test_worker("local", true);
    let config = EncodeConfig {
        container: "mkv".into(),
        ..EncodeConfig::default()
    };
    let job = fx
        .dispatch(create_job(&source, config, None, 0, 3), &worker, TransferMode::SshPull)
        .await;

    assert_eq!(fx.run(&job, &worker).await, RunOutcome::Completed);

    let replaced = fx.path("film.mkv");
    assert_eq!(std::fs::read(&replaced).unwrap(), b"encoded-output");
    assert!(!std::path::Path::new(&source).exists());
    assert_eq!(fx.stored(&job.id).await.output_path, Some(replaced));
    let staging = fx.dir.path().join("staging");
    assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
}

#[tokio::test]
async fn test_ssh_pull_without_origin_is_terminal() {
    let fx = Fixture::new(false, 10.0);
    let source = fx.media("film.mkv", b"CCCC-source");
    let worker = test_worker("local", true);
    let job = fx
        .dispatch(
            create_job(&source, EncodeConfig::default(), None, 0, 3),
            &worker,
            TransferMode::SshPull,
        )
        .await;

    let outcome = fx.run(&job, &worker).await;
    assert_eq!(outcome, RunOutcome::Recovered(FailureOutcome::Failed));
}

async fn run_and_cancel(fx: &Fixture, reason: CancelReason) -> (Job, RunOutcome) {
    let source = fx.media("slow.mkv", b"slow-source");
    let worker = test_worker("local", true);
    let job = fx
        .dispatch(
            create_job(&source, EncodeConfig::default(), None, 0, 3),
            &worker,
            TransferMode::Local,
        )
        .await;

    let handle = fx.cancels.register(&job.id);
    let executor = fx.executor.clone();
    let (run_job, run_worker) = (job.clone(), worker.clone());
    let task = tokio::spawn(async move { executor.run(run_job, run_worker, handle).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.cancels.cancel(&job.id, reason));
    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    (job, outcome)
}

#[tokio::test]
async fn test_operator_cancel_kills_encoder() {
    let fx = Fixture::new(false, 10.0);
    let (job, outcome) = run_and_cancel(&fx, CancelReason::Operator).await;

    assert_eq!(outcome, RunOutcome::Recovered(FailureOutcome::Cancelled));
    assert_eq!(fx.stored(&job.id).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_stuck_cancel_is_retried() {
    let fx = Fixture::new(false, 10.0);
    let (job, outcome) = run_and_cancel(&fx, CancelReason::Stuck).await;

    assert!(matches!(
        outcome,
        RunOutcome::Recovered(FailureOutcome::Retrying { retry_count: 1, .. })
    ));
    let stored = fx.stored(&job.id).await;
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.assigned_worker_id, None);
}
