//! Preflight checks run before the daemon starts.
//!
//! - ffmpeg and ffprobe answer `-version`
//! - the state and staging directories exist and are writable
//! - hardware families declared for local workers have matching encoders in this ffmpeg

use crate::config::Config;
use crate::workers::HardwareFamily;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("directory {path} is not usable: {reason}")]
    Directory { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extract the major version from `ffmpeg -version` or `ffprobe -version` output.
///
/// Handles release numbers (`6.1.1`) and `n`-prefixed git builds (`n7.0-12-gabc`).
pub fn parse_tool_version(tool: &str, version_output: &str) -> Option<u32> {
    let marker = format!("{} version", tool);
    let line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;
    let version = line.split(&marker).nth(1)?.split_whitespace().next()?;
    version
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Encoder names from `ffmpeg -hide_banner -encoders`.
pub fn parse_encoder_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            // rows look like " V....D hevc_nvenc  NVIDIA NVENC hevc encoder"
            let is_row = flags.len() == 6
                && flags.starts_with(['V', 'A', 'S'])
                && flags.chars().skip(1).all(|c| c == '.' || c.is_ascii_uppercase());
            (is_row && name != "=").then(|| name.to_string())
        })
        .collect()
}

fn family_suffix(family: HardwareFamily) -> &'static str {
    match family {
        HardwareFamily::Nvenc => "_nvenc",
        HardwareFamily::Qsv => "_qsv",
        HardwareFamily::Videotoolbox => "_videotoolbox",
    }
}

/// Hardware families that no encoder in `encoders` can serve.
pub fn missing_hardware(
    declared: &BTreeSet<HardwareFamily>,
    encoders: &BTreeSet<String>,
) -> Vec<HardwareFamily> {
    declared
        .iter()
        .copied()
        .filter(|family| {
            !encoders
                .iter()
                .any(|e| e.ends_with(family_suffix(*family)))
        })
        .collect()
}

fn run_version(program: &str, tool: &str) -> Result<u32, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        reason,
    };
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("failed to run {} -version: {}", program, e)))?;
    if !output.status.success() {
        return Err(unavailable(format!("{} -version failed", program)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_tool_version(tool, &text).ok_or_else(|| {
        unavailable(format!(
            "could not parse version from: {}",
            text.lines().next().unwrap_or("(empty)")
        ))
    })
}

pub fn check_ffmpeg(program: &str) -> Result<u32, StartupError> {
    run_version(program, "ffmpeg")
}

pub fn check_ffprobe(program: &str) -> Result<u32, StartupError> {
    run_version(program, "ffprobe")
}

/// Create `path` if needed and prove it is writable.
pub fn check_writable_dir(path: &Path) -> Result<(), StartupError> {
    let fail = |e: std::io::Error| StartupError::Directory {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    std::fs::create_dir_all(path).map_err(fail)?;
    let probe = path.join(".fleetcode-write-test");
    std::fs::write(&probe, b"ok").map_err(fail)?;
    std::fs::remove_file(&probe).map_err(fail)?;
    Ok(())
}

fn local_encoders(ffmpeg: &str) -> Option<BTreeSet<String>> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Run every preflight check. Missing hardware encoders only warn; the fallback ladder
/// covers them at run time.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let ffmpeg = check_ffmpeg(&cfg.encoder.ffmpeg_path)?;
    let ffprobe = check_ffprobe(&cfg.encoder.ffprobe_path)?;
    info!(ffmpeg, ffprobe, "encoder tools found");

    check_writable_dir(&cfg.paths.state_dir)?;
    check_writable_dir(&cfg.paths.staging_dir)?;

    let declared: BTreeSet<HardwareFamily> = cfg
        .workers
        .iter()
        .filter(|w| w.is_local)
        .flat_map(|w| w.hardware.iter().filter_map(|h| HardwareFamily::parse(h)))
        .collect();
    if !declared.is_empty() {
        match local_encoders(&cfg.encoder.ffmpeg_path) {
            Some(encoders) => {
                for family in missing_hardware(&declared, &encoders) {
                    warn!(?family, "local worker declares hardware that ffmpeg cannot encode with");
                }
            }
            None => warn!("could not list ffmpeg encoders"),
        }
    }
    Ok(())
}
