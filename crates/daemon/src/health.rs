//! Worker health monitoring.
//!
//! Each round marks local workers online, tests remote workers' connections and refreshes
//! the per-worker telemetry table that the metrics endpoint serves. Workers that keep failing
//! are disabled.

use crate::events::{JobEvent, SharedSink};
use crate::jobs::{current_timestamp_ms, WorkerId};
use crate::store::{RecordStore, StoreError};
use crate::transport::{Transport, TransportFactory};
use crate::workers::{Worker, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const REMOTE_SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Last resource sample taken for a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerTelemetry {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub cpu_cores: Option<usize>,
    /// Only sampled on the local machine.
    pub cpu_usage_percent: Option<f32>,
    pub mem_usage_percent: Option<f32>,
    pub load_avg_1: Option<f32>,
    pub load_avg_5: Option<f32>,
    pub load_avg_15: Option<f32>,
    pub active_jobs: u32,
    pub max_concurrent_jobs: u32,
    pub sampled_at_ms: i64,
}

/// Telemetry keyed by worker id. Written only by the [`HealthMonitor`].
pub type TelemetryTable = Arc<RwLock<HashMap<WorkerId, WorkerTelemetry>>>;

/// What one health round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub online: Vec<WorkerId>,
    pub offline: Vec<WorkerId>,
    pub disabled: Vec<WorkerId>,
}

/// Sample CPU, memory and load of this machine.
pub fn sample_local(worker: &Worker, active_jobs: u32) -> WorkerTelemetry {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        Some((sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32)
    } else {
        None
    };
    let load = System::load_average();

    WorkerTelemetry {
        worker_id: worker.id.clone(),
        status: WorkerStatus::Online,
        cpu_cores: Some(num_cpus::get()),
        cpu_usage_percent: Some(sys.global_cpu_usage()),
        mem_usage_percent: mem_usage,
        load_avg_1: Some(load.one as f32),
        load_avg_5: Some(load.five as f32),
        load_avg_15: Some(load.fifteen as f32),
        active_jobs,
        max_concurrent_jobs: worker.max_concurrent_jobs,
        sampled_at_ms: current_timestamp_ms(),
    }
}

/// Parse the output of `nproc; cat /proc/loadavg`.
///
/// ```
/// use fleetcode::health::parse_remote_sample;
///
/// let (cores, load) = parse_remote_sample("8\n0.52 0.58 0.59 1/423 12345\n");
/// assert_eq!(cores, Some(8));
/// assert_eq!(load, Some([0.52, 0.58, 0.59]));
/// ```
pub fn parse_remote_sample(output: &str) -> (Option<usize>, Option<[f32; 3]>) {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let cores = lines.next().and_then(|l| l.parse().ok());
    let load = lines.next().and_then(|l| {
        let mut fields = l.split_whitespace().map(|f| f.parse::<f32>().ok());
        match (fields.next()?, fields.next()?, fields.next()?) {
            (Some(a), Some(b), Some(c)) => Some([a, b, c]),
            _ => None,
        }
    });
    (cores, load)
}

async fn sample_remote(host: &dyn Transport, worker: &Worker, active_jobs: u32) -> WorkerTelemetry {
    let (cores, load) = match host
        .run_command("nproc; cat /proc/loadavg", Some(REMOTE_SAMPLE_TIMEOUT))
        .await
    {
        Ok(out) if out.success() => parse_remote_sample(&out.stdout),
        Ok(out) => {
            debug!(worker_id = %worker.id, stderr = %out.stderr.trim(), "remote sample failed");
            (None, None)
        }
        Err(e) => {
            debug!(worker_id = %worker.id, error = %e, "remote sample failed");
            (None, None)
        }
    };
    WorkerTelemetry {
        worker_id: worker.id.clone(),
        status: WorkerStatus::Online,
        cpu_cores: cores,
        cpu_usage_percent: None,
        mem_usage_percent: None,
        load_avg_1: load.map(|l| l[0]),
        load_avg_5: load.map(|l| l[1]),
        load_avg_15: load.map(|l| l[2]),
        active_jobs,
        max_concurrent_jobs: worker.max_concurrent_jobs,
        sampled_at_ms: current_timestamp_ms(),
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<dyn RecordStore>,
    transports: Arc<dyn TransportFactory>,
    events: SharedSink,
    telemetry: TelemetryTable,
    auto_disable_threshold: u32,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transports: Arc<dyn TransportFactory>,
        events: SharedSink,
        auto_disable_threshold: u32,
    ) -> Self {
        Self {
            store,
            transports,
            events,
            telemetry: Arc::new(RwLock::new(HashMap::new())),
            auto_disable_threshold,
        }
    }

    /// Shared handle to the telemetry table, for readers.
    pub fn telemetry(&self) -> TelemetryTable {
        self.telemetry.clone()
    }

    /// Telemetry rows sorted by worker id.
    pub async fn snapshot(&self) -> Vec<WorkerTelemetry> {
        let mut rows: Vec<WorkerTelemetry> = self.telemetry.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        rows
    }

    /// Check every enabled worker once.
    pub async fn check_all(&self) -> Result<HealthReport, StoreError> {
        let counts = self.store.active_counts().await?;
        let mut report = HealthReport::default();

        for worker in self.store.list_workers().await? {
            if !worker.is_enabled {
                self.telemetry.write().await.remove(&worker.id);
                continue;
            }
            let active = counts.get(&worker.id).copied().unwrap_or(0);
            let host = if worker.is_local {
                None
            } else {
                match self.transports.for_worker(&worker) {
                    Ok(host) => Some(host),
                    Err(e) => {
                        warn!(worker_id = %worker.id, error = %e, "worker has no usable transport");
                        self.mark_unreachable(&worker, &mut report).await?;
                        continue;
                    }
                }
            };

            let sample = match host {
                None => sample_local(&worker, active),
                Some(host) => {
                    if !host.test_connection().await {
                        self.mark_unreachable(&worker, &mut report).await?;
                        continue;
                    }
                    sample_remote(host.as_ref(), &worker, active).await
                }
            };
            self.mark_online(&worker).await?;
            self.telemetry
                .write()
                .await
                .insert(worker.id.clone(), sample);
            report.online.push(worker.id.clone());
        }
        Ok(report)
    }

    async fn mark_online(&self, worker: &Worker) -> Result<(), StoreError> {
        let was_online = worker.status == WorkerStatus::Online;
        self.store
            .update_worker(&worker.id, &mut |w: &mut Worker| {
                w.status = WorkerStatus::Online;
                w.consecutive_failures = 0;
            })
            .await?;
        if !was_online {
            info!(worker_id = %worker.id, "worker online");
            self.events.emit(JobEvent::WorkerOnline {
                worker_id: worker.id.clone(),
            });
        }
        Ok(())
    }

    async fn mark_unreachable(
        &self,
        worker: &Worker,
        report: &mut HealthReport,
    ) -> Result<(), StoreError> {
        let threshold = self.auto_disable_threshold;
        let updated = self
            .store
            .update_worker(&worker.id, &mut |w: &mut Worker| {
                w.status = WorkerStatus::Offline;
                w.consecutive_failures += 1;
                if threshold > 0 && w.consecutive_failures >= threshold {
                    w.is_enabled = false;
                }
            })
            .await?;
        self.telemetry.write().await.remove(&worker.id);

        warn!(
            worker_id = %worker.id,
            consecutive_failures = updated.consecutive_failures,
            "worker connection test failed"
        );
        self.events.emit(JobEvent::WorkerOffline {
            worker_id: worker.id.clone(),
            consecutive_failures: updated.consecutive_failures,
        });
        report.offline.push(worker.id.clone());

        if !updated.is_enabled {
            warn!(worker_id = %worker.id, "worker disabled after repeated failures");
            self.events.emit(JobEvent::WorkerDisabled {
                worker_id: worker.id.clone(),
            });
            report.disabled.push(worker.id.clone());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::store::MemoryStore;
    use crate::transport::{LocalTransport, TransportError};
    use crate::workers::test_worker;
    use async_trait::async_trait;
    use tokio::process::Command;

    /// A host whose shell always exits non-zero.
    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        fn describe(&self) -> String {
            "unreachable".to_string()
        }

        fn shell_command(&self, _command: &str) -> Command {
            Command::new("false")
        }
    }

    struct Hosts {
        reachable: bool,
    }

    impl TransportFactory for Hosts {
        fn for_worker(&self, _worker: &Worker) -> Result<Arc<dyn Transport>, TransportError> {
            if self.reachable {
                Ok(Arc::new(LocalTransport))
            } else {
                Ok(Arc::new(Unreachable))
            }
        }
        fn origin(&self) -> Option<Arc<dyn Transport>> {
            None
        }
        fn local(&self) -> Arc<dyn Transport> {
            Arc::new(LocalTransport)
        }
    }

    async fn monitor(reachable: bool, threshold: u32) -> (HealthMonitor, Arc<MemoryStore>, Arc<RecordingSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let monitor = HealthMonitor::new(
            store.clone(),
            Arc::new(Hosts { reachable }),
            sink.clone(),
            threshold,
        );
        (monitor, store, sink)
    }

    #[test]
    fn test_parse_remote_sample_tolerates_garbage() {
        assert_eq!(parse_remote_sample(""), (None, None));
        assert_eq!(parse_remote_sample("x\nnot numbers here\n"), (None, None));
        assert_eq!(parse_remote_sample("4\n"), (Some(4), None));
    }

    #[tokio::test]
    async fn test_local_worker_gets_sampled() {
        let (monitor, store, _) = monitor(true, 5).await;
        store.upsert_worker(&test_worker("local", true)).await.unwrap();

        let report = monitor.check_all().await.unwrap();
        assert_eq!(report.online, vec!["local".to_string()]);

        let rows = monitor.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cpu_cores, Some(num_cpus::get()));
        assert!(rows[0].mem_usage_percent.is_some());
    }

    #[tokio::test]
    async fn test_remote_worker_recovers() {
        let (monitor, store, sink) = monitor(true, 5).await;
        let mut worker = test_worker("remote", false);
        worker.status = WorkerStatus::Offline;
        worker.consecutive_failures = 3;
        store.upsert_worker(&worker).await.unwrap();

        monitor.check_all().await.unwrap();

        let stored = store.get_worker("remote").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkerStatus::Online);
        assert_eq!(stored.consecutive_failures, 0);
        assert!(sink
            .events()
            .contains(&JobEvent::WorkerOnline { worker_id: "remote".into() }));
        assert_eq!(monitor.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_disabled_at_threshold() {
        let (monitor, store, sink) = monitor(false, 2).await;
        store.upsert_worker(&test_worker("remote", false)).await.unwrap();

        let first = monitor.check_all().await.unwrap();
        assert_eq!(first.offline, vec!["remote".to_string()]);
        assert!(first.disabled.is_empty());
        let stored = store.get_worker("remote").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkerStatus::Offline);
        assert!(stored.is_enabled);

        let second = monitor.check_all().await.unwrap();
        assert_eq!(second.disabled, vec!["remote".to_string()]);
        let stored = store.get_worker("remote").await.unwrap().unwrap();
        assert!(!stored.is_enabled);
        assert_eq!(stored.consecutive_failures, 2);
        assert!(monitor.snapshot().await.is_empty());

        // disabled workers are no longer tested
        let third = monitor.check_all().await.unwrap();
        assert_eq!(third, HealthReport::default());
        let disabled_events = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, JobEvent::WorkerDisabled { .. }))
            .count();
        assert_eq!(disabled_events, 1);
    }
}
