//! Worker records.

use crate::config::{HostConfig, WorkerConfig};
use crate::jobs::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Scratch directory used when a worker does not name one.
pub const DEFAULT_WORKING_DIRECTORY: &str = "/tmp/fleetcode";

/// Performance score assumed for workers that were never benchmarked.
pub const DEFAULT_PERFORMANCE_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Offline,
    Online,
    Provisioning,
    SetupFailed,
}

/// Hardware encoder families a worker can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareFamily {
    Nvenc,
    Qsv,
    Videotoolbox,
}

impl HardwareFamily {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvenc" | "nvidia" | "cuda" => Some(HardwareFamily::Nvenc),
            "qsv" | "intel" => Some(HardwareFamily::Qsv),
            "videotoolbox" | "vt" => Some(HardwareFamily::Videotoolbox),
            _ => None,
        }
    }
}

/// Rewrites a source path prefix into the worker's view of the same file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub source_prefix: String,
    pub target_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    /// Connection details; absent for the local worker.
    #[serde(default)]
    pub host: Option<HostConfig>,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: u32,
    /// 0-100, higher is faster.
    #[serde(default)]
    pub performance_score: Option<f64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,
    #[serde(default)]
    pub hardware: BTreeSet<HardwareFamily>,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
}

fn default_true() -> bool {
    true
}

fn default_max_jobs() -> u32 {
    1
}

fn default_working_directory() -> String {
    DEFAULT_WORKING_DIRECTORY.to_string()
}

impl Worker {
    pub fn is_available(&self) -> bool {
        self.is_enabled && self.status == WorkerStatus::Online
    }

    pub fn performance(&self) -> f64 {
        self.performance_score.unwrap_or(DEFAULT_PERFORMANCE_SCORE)
    }

    pub fn has_hardware(&self, family: HardwareFamily) -> bool {
        self.hardware.contains(&family)
    }

    /// Scratch path on the worker for a job file: `{working_directory}/{job_id}_{file name}`.
    pub fn scratch_path(&self, job_id: &str, source_path: &str) -> String {
        let name = std::path::Path::new(source_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        format!(
            "{}/{}_{}",
            self.working_directory.trim_end_matches('/'),
            job_id,
            name
        )
    }
}

impl From<&WorkerConfig> for Worker {
    fn from(cfg: &WorkerConfig) -> Self {
        let hardware = cfg
            .hardware
            .iter()
            .filter_map(|h| HardwareFamily::parse(h))
            .collect();
        Worker {
            id: cfg.id.clone(),
            name: cfg.name.clone().unwrap_or_else(|| cfg.id.clone()),
            host: cfg.host.clone(),
            is_local: cfg.is_local,
            is_enabled: cfg.enabled,
            // local workers never go through a connection test
            status: if cfg.is_local {
                WorkerStatus::Online
            } else {
                WorkerStatus::Offline
            },
            max_concurrent_jobs: cfg.max_concurrent_jobs,
            performance_score: cfg.performance_score,
            consecutive_failures: 0,
            path_mappings: cfg
                .path_mappings
                .iter()
                .map(|m| PathMapping {
                    source_prefix: m.source_prefix.clone(),
                    target_prefix: m.target_prefix.clone(),
                })
                .collect(),
            hardware,
            working_directory: cfg
                .working_directory
                .clone()
                .unwrap_or_else(default_working_directory),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_worker(id: &str, is_local: bool) -> Worker {
    Worker {
        id: id.to_string(),
        name: id.to_string(),
        host: None,
        is_local,
        is_enabled: true,
        status: WorkerStatus::Online,
        max_concurrent_jobs: 1,
        performance_score: None,
        consecutive_failures: 0,
        path_mappings: Vec::new(),
        hardware: BTreeSet::new(),
        working_directory: DEFAULT_WORKING_DIRECTORY.to_string(),
    }
}
