//! fleetcode
//!
//! Distributed transcoding scheduler: assigns queued jobs to local and remote workers,
//! moves media between the origin and workers, runs the encoder with hardware fallback,
//! verifies the output and replaces the source.

pub mod assign;
pub mod cancel;
pub mod daemon;
pub mod encode;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod mode;
pub mod prefetch;
pub mod probe;
pub mod recovery;
pub mod replace;
pub mod startup;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod validate;
pub mod workers;

pub use fleetcode_config as config;
pub use fleetcode_config::Config;

pub use assign::{Assignment, WorkerScheduler};
pub use cancel::{CancelHandle, CancelReason, CancelRegistry};
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeConfig, EncoderInvocation, FfmpegInvocation, HwAccel, VideoCodec};
pub use error::JobError;
pub use events::{BroadcastSink, EventSink, FanoutSink, JobEvent, SharedSink, TracingSink};
pub use executor::{ExecutorSettings, JobExecutor, RunOutcome};
pub use health::{HealthMonitor, WorkerTelemetry};
pub use jobs::{
    create_job, create_manual_job, Job, JobId, JobLog, JobStatus, TransferMode, ValidationStatus,
    WorkerId,
};
pub use metrics::{new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use probe::{FfprobeProbe, MediaProbe, ProbeError, ProbeResult};
pub use recovery::{handle_failure, recover_after_crash, FailureOutcome};
pub use startup::{run_startup_checks, StartupError};
pub use store::{JsonFileStore, MemoryStore, RecordStore, StoreError};
pub use transfer::{TransferEngine, TransferError, TransferSettings};
pub use transport::{
    DefaultTransportFactory, LocalTransport, SshTransport, Transport, TransportError,
    TransportFactory,
};
pub use workers::{HardwareFamily, Worker, WorkerStatus};
