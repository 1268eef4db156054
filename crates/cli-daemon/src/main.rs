//! CLI entry point for fleetcode
//!
//! `run` starts the daemon; `submit`, `cancel` and `status` work directly on the record
//! store in the state directory, so they can be used while the daemon runs.

use clap::{Parser, Subcommand};
use fleetcode::logging::{init_logging, init_logging_stderr};
use fleetcode::store::{JsonFileStore, RecordStore};
use fleetcode::{
    create_job, create_manual_job, run_startup_checks, Config, Daemon, EncodeConfig, Job,
    JobStatus, VideoCodec,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// fleetcode - distributed transcoding scheduler
#[derive(Parser, Debug)]
#[command(name = "fleetcode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "fleetcode.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Run {
        /// Skip the ffmpeg/ffprobe preflight checks
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Queue a file for transcoding
    Submit {
        file: PathBuf,
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// ffmpeg encoder name, e.g. libx265 or hevc_nvenc
        #[arg(long, default_value = "libx265")]
        codec: VideoCodec,
        #[arg(long, default_value = "mkv")]
        container: String,
        /// Prefer this worker
        #[arg(long)]
        worker: Option<String>,
        /// Replace the source instead of writing "<name> V2.<container>" beside it
        #[arg(long, default_value = "false")]
        replace: bool,
    },
    /// Request cancellation of a job
    Cancel { job_id: String },
    /// Show the queue and running jobs
    Status {
        /// Include finished jobs
        #[arg(long, default_value = "false")]
        all: bool,
    },
}

/// Load the config file, or defaults plus environment overrides when it does not exist.
fn load_config(path: &Path) -> Result<Config, String> {
    if path.exists() {
        return Config::load(path).map_err(|e| e.to_string());
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf, String> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|e| format!("cannot resolve {}: {}", path.display(), e))
}

async fn run(config: Config, skip_checks: bool) -> Result<(), String> {
    if skip_checks {
        tracing::warn!("skipping startup checks");
    } else {
        run_startup_checks(&config).map_err(|e| e.to_string())?;
    }
    let daemon = Daemon::from_config(config).map_err(|e| e.to_string())?;
    daemon.run().await.map_err(|e| e.to_string())
}

async fn submit(
    store: &JsonFileStore,
    config: &Config,
    file: &Path,
    priority: i32,
    encode: EncodeConfig,
    worker: Option<String>,
    replace: bool,
) -> Result<Job, String> {
    let source = absolute(file)?;
    let source = source.to_string_lossy();
    let max_retries = config.recovery.max_retries;
    let mut job = if replace {
        create_job(&source, encode, None, priority, max_retries)
    } else {
        create_manual_job(&source, encode, priority, max_retries)
    };
    if let Some(worker_id) = worker {
        let known = store
            .get_worker(&worker_id)
            .await
            .map_err(|e| e.to_string())?
            .is_some();
        let configured = config.workers.iter().any(|w| w.id == worker_id);
        if !known && !configured {
            return Err(format!("unknown worker '{}'", worker_id));
        }
        job.assigned_worker_id = Some(worker_id);
    }
    store.insert_job(&job).await.map_err(|e| e.to_string())?;
    Ok(job)
}

async fn cancel(store: &JsonFileStore, job_id: &str) -> Result<JobStatus, String> {
    let job = store
        .get_job(job_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no job with id {}", job_id))?;
    if job.is_terminal() {
        return Err(format!("job {} already {}", job_id, job.status));
    }
    store
        .update_job(job_id, &mut |j: &mut Job| j.cancel_requested = true)
        .await
        .map_err(|e| e.to_string())?;
    Ok(job.status)
}

fn format_percent(value: Option<f64>) -> String {
    value.map(|p| format!("{:.1}%", p)).unwrap_or_else(|| "-".to_string())
}

async fn status(store: &JsonFileStore, all: bool) -> Result<(), String> {
    let mut jobs = store.list_jobs().await.map_err(|e| e.to_string())?;
    jobs.retain(|j| all || !j.is_terminal());
    jobs.sort_by(|a, b| {
        a.is_terminal()
            .cmp(&b.is_terminal())
            .then(b.priority.cmp(&a.priority))
            .then(a.created_at.cmp(&b.created_at))
    });

    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    println!(
        "{:<36}  {:<12}  {:>4}  {:<12}  {:>8}  {:>5}  SOURCE",
        "ID", "STATUS", "PRIO", "WORKER", "PROGRESS", "RETRY"
    );
    for job in &jobs {
        let status = if job.cancel_requested && !job.is_terminal() {
            format!("{}*", job.status)
        } else {
            job.status.to_string()
        };
        println!(
            "{:<36}  {:<12}  {:>4}  {:<12}  {:>8}  {:>5}  {}",
            job.id,
            status,
            job.priority,
            job.assigned_worker_id.as_deref().unwrap_or("-"),
            format_percent(job.progress_percent),
            format!("{}/{}", job.retry_count, job.max_retries),
            job.source_path
        );
    }

    let workers = store.list_workers().await.map_err(|e| e.to_string())?;
    if !workers.is_empty() {
        println!();
        for worker in workers {
            println!(
                "worker {:<12} {:?}{} ({} failures)",
                worker.id,
                worker.status,
                if worker.is_enabled { "" } else { ", disabled" },
                worker.consecutive_failures
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Run { skip_checks } => {
            if let Err(e) = init_logging(&config.paths.state_dir) {
                init_logging_stderr();
                tracing::warn!(error = %e, "log file unavailable, logging to stderr");
            }
            run(config, skip_checks).await
        }
        command => {
            init_logging_stderr();
            let store = match JsonFileStore::open(&config.paths.state_dir) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("Failed to open state directory: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            match command {
                Command::Submit {
                    file,
                    priority,
                    codec,
                    container,
                    worker,
                    replace,
                } => {
                    let encode = EncodeConfig {
                        video_codec: codec,
                        container,
                        ..EncodeConfig::default()
                    };
                    submit(&store, &config, &file, priority, encode, worker, replace)
                        .await
                        .map(|job| println!("queued {}", job.id))
                }
                Command::Cancel { job_id } => cancel(&store, &job_id)
                    .await
                    .map(|was| println!("cancellation requested for {} ({})", job_id, was)),
                Command::Status { all } => status(&store, all).await,
                Command::Run { .. } => Ok(()),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_args_parse_submit() {
        let args = Args::try_parse_from([
            "fleetcode",
            "submit",
            "/media/a.mkv",
            "--codec",
            "hevc_nvenc",
            "--priority",
            "5",
        ])
        .unwrap();
        match args.command {
            Command::Submit {
                codec,
                priority,
                replace,
                ..
            } => {
                assert_eq!(codec, VideoCodec::HevcNvenc);
                assert_eq!(priority, 5);
                assert!(!replace);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_codec_is_rejected() {
        assert!(Args::try_parse_from(["fleetcode", "submit", "a.mkv", "--codec", "vp9"]).is_err());
    }

    #[tokio::test]
    async fn test_submit_then_cancel() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let config = Config::default();

        let job = submit(
            &store,
            &config,
            Path::new("/media/movie.mkv"),
            3,
            EncodeConfig::default(),
            None,
            false,
        )
        .await
        .unwrap();
        assert!(job.is_manual);
        assert_eq!(job.output_path.as_deref(), Some("/media/movie V2.mkv"));

        assert_eq!(cancel(&store, &job.id).await.unwrap(), JobStatus::Queued);
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(stored.cancel_requested);
        assert!(cancel(&store, "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_worker() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let err = submit(
            &store,
            &Config::default(),
            Path::new("/media/movie.mkv"),
            0,
            EncodeConfig::default(),
            Some("ghost".into()),
            true,
        )
        .await
        .unwrap_err();
        assert!(err.contains("ghost"));
    }
}
