//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values that parse but cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Dequeue loop and sweep timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Queue poll interval in milliseconds (default 2000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the stuck-job sweep runs (default 60s)
    #[serde(default = "default_stuck_sweep_interval_secs")]
    pub stuck_sweep_interval_secs: u64,
    /// A transcoding job with no telemetry for this long is stuck (default 30)
    #[serde(default = "default_stuck_timeout_minutes")]
    pub stuck_timeout_minutes: u64,
    /// Swap software codecs for NVENC equivalents when the assigned worker has a GPU
    #[serde(default = "default_true")]
    pub auto_hardware_upgrade: bool,
    /// Bind address of the metrics endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_stuck_sweep_interval_secs() -> u64 {
    60
}

fn default_stuck_timeout_minutes() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "127.0.0.1:7979".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stuck_sweep_interval_secs: default_stuck_sweep_interval_secs(),
            stuck_timeout_minutes: default_stuck_timeout_minutes(),
            auto_hardware_upgrade: true,
            metrics_addr: default_metrics_addr(),
        }
    }
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// Retries granted to new jobs (default 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before retry k, capped at the last entry
    #[serde(default = "default_backoff_minutes")]
    pub backoff_minutes: Vec<u64>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_minutes() -> Vec<u64> {
    vec![1, 5, 15]
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_minutes: default_backoff_minutes(),
        }
    }
}

/// Transfer strategy thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// Files at or above this size use parallel segments (default 100 MiB)
    #[serde(default = "default_parallel_threshold_bytes")]
    pub parallel_threshold_bytes: u64,
    /// Number of concurrent segments
    #[serde(default = "default_segments")]
    pub segments: u32,
    /// Chunk size of the fallback copy loop and the relay queue
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    /// Interval between progress polls and callbacks
    #[serde(default = "default_progress_poll_ms")]
    pub progress_poll_ms: u64,
    /// Bounded relay queue depth in chunks
    #[serde(default = "default_relay_queue_depth")]
    pub relay_queue_depth: usize,
}

fn default_parallel_threshold_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_segments() -> u32 {
    4
}

fn default_chunk_size_bytes() -> usize {
    1024 * 1024
}

fn default_progress_poll_ms() -> u64 {
    500
}

fn default_relay_queue_depth() -> usize {
    8
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_threshold_bytes: default_parallel_threshold_bytes(),
            segments: default_segments(),
            chunk_size_bytes: default_chunk_size_bytes(),
            progress_poll_ms: default_progress_poll_ms(),
            relay_queue_depth: default_relay_queue_depth(),
        }
    }
}

/// Output validation thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    /// Outputs smaller than this are rejected (default 1 MiB)
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Allowed difference between source and output duration
    #[serde(default = "default_duration_tolerance_secs")]
    pub duration_tolerance_secs: f64,
}

fn default_min_output_bytes() -> u64 {
    1024 * 1024
}

fn default_duration_tolerance_secs() -> f64 {
    2.0
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_output_bytes: default_min_output_bytes(),
            duration_tolerance_secs: default_duration_tolerance_secs(),
        }
    }
}

/// Local directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Job and worker records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Scratch space for pulled sources and downloaded outputs
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./fleetcode-state")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/tmp/fleetcode")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            staging_dir: default_staging_dir(),
        }
    }
}

/// External encoder tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Tag inserted before the container extension of catalog outputs
    #[serde(default = "default_output_tag")]
    pub output_tag: String,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_output_tag() -> String {
    "fleetcode".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            output_tag: default_output_tag(),
        }
    }
}

/// Worker health checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failed checks before a worker is disabled (default 5)
    #[serde(default = "default_auto_disable_threshold")]
    pub auto_disable_threshold: u32,
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_auto_disable_threshold() -> u32 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            auto_disable_threshold: default_auto_disable_threshold(),
        }
    }
}

/// SSH endpoint of a host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// The media origin. With `ssh` set, sources can be pulled and relayed from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OriginConfig {
    #[serde(default)]
    pub ssh: Option<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathMappingConfig {
    pub source_prefix: String,
    pub target_prefix: String,
}

/// A worker definition seeded into the record store at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub host: Option<HostConfig>,
    #[serde(default = "default_worker_max_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default)]
    pub performance_score: Option<f64>,
    #[serde(default)]
    pub path_mappings: Vec<PathMappingConfig>,
    /// Hardware encoder families, e.g. `["nvenc"]`
    #[serde(default)]
    pub hardware: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_worker_max_jobs() -> u32 {
    1
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FLEETCODE_POLL_INTERVAL_MS -> scheduler.poll_interval_ms
    /// - FLEETCODE_STUCK_TIMEOUT_MINUTES -> scheduler.stuck_timeout_minutes
    /// - FLEETCODE_MAX_RETRIES -> recovery.max_retries
    /// - FLEETCODE_STATE_DIR -> paths.state_dir
    /// - FLEETCODE_STAGING_DIR -> paths.staging_dir
    /// - FLEETCODE_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - FLEETCODE_FFPROBE_PATH -> encoder.ffprobe_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FLEETCODE_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.scheduler.poll_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("FLEETCODE_STUCK_TIMEOUT_MINUTES") {
            if let Ok(minutes) = val.parse::<u64>() {
                self.scheduler.stuck_timeout_minutes = minutes;
            }
        }

        if let Ok(val) = env::var("FLEETCODE_MAX_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.recovery.max_retries = retries;
            }
        }

        if let Ok(val) = env::var("FLEETCODE_STATE_DIR") {
            if !val.is_empty() {
                self.paths.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FLEETCODE_STAGING_DIR") {
            if !val.is_empty() {
                self.paths.staging_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FLEETCODE_FFMPEG_PATH") {
            if !val.is_empty() {
                self.encoder.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("FLEETCODE_FFPROBE_PATH") {
            if !val.is_empty() {
                self.encoder.ffprobe_path = val;
            }
        }
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.recovery.backoff_minutes.is_empty() {
            return Err(ConfigError::Invalid(
                "recovery.backoff_minutes must not be empty".to_string(),
            ));
        }
        if self.transfer.segments == 0 {
            return Err(ConfigError::Invalid(
                "transfer.segments must be at least 1".to_string(),
            ));
        }
        if self.transfer.chunk_size_bytes == 0 || self.transfer.relay_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "transfer.chunk_size_bytes and transfer.relay_queue_depth must be positive"
                    .to_string(),
            ));
        }
        for worker in &self.workers {
            if !worker.is_local && worker.host.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "worker '{}' is remote but has no [host]",
                    worker.id
                )));
            }
            if let Some(score) = worker.performance_score {
                if !(0.0..=100.0).contains(&score) {
                    return Err(ConfigError::Invalid(format!(
                        "worker '{}' performance_score {} outside 0-100",
                        worker.id, score
                    )));
                }
            }
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
