//! Media probing through ffprobe.
//!
//! Probes run through a [`Transport`], so a file is inspected on whichever host holds it.

use crate::transport::{shell_quote, Transport, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but rejected the file.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Information about a video stream from ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "av1").
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Bitrate in kbps (if available).
    pub bitrate_kbps: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub codec_name: String,
    pub channels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    pub format: FormatInfo,
}

impl ProbeResult {
    /// Duration when ffprobe reported one.
    pub fn duration(&self) -> Option<f64> {
        Some(self.format.duration_secs).filter(|d| *d > 0.0)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();

    for stream in streams {
        let codec_name = stream.codec_name.clone().unwrap_or_default();
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                // cover art shows up as a video stream without dimensions
                let (Some(width), Some(height)) = (stream.width, stream.height) else {
                    continue;
                };
                let bitrate_kbps = stream
                    .bit_rate
                    .as_ref()
                    .and_then(|br| br.parse::<f64>().ok())
                    .map(|bps| (bps / 1000.0) as f32);
                video_streams.push(VideoStream {
                    codec_name,
                    width,
                    height,
                    bitrate_kbps,
                });
            }
            "audio" => audio_streams.push(AudioStream {
                codec_name,
                channels: stream.channels.unwrap_or(0),
            }),
            _ => {}
        }
    }

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        video_streams,
        audio_streams,
        format: FormatInfo {
            duration_secs,
            size_bytes,
        },
    })
}

/// Inspects a media file on a host.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, host: &dyn Transport, path: &str) -> Result<ProbeResult, ProbeError>;
}

/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>` on the host.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    pub ffprobe_path: String,
    pub timeout: Duration,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, host: &dyn Transport, path: &str) -> Result<ProbeResult, ProbeError> {
        let command = format!(
            "{} -v quiet -print_format json -show_streams -show_format {}",
            shell_quote(&self.ffprobe_path),
            shell_quote(path)
        );
        let output = host.run_command(&command, Some(self.timeout)).await?;
        if !output.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        parse_ffprobe_output(&output.stdout)
    }
}
