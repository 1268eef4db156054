//! Encoder command construction.
//!
//! Builds the ffmpeg invocation for a job from its resolved configuration. The command is
//! kept as an argv vector and rendered into a shell line only when it is handed to a
//! transport, so the same command runs locally or over SSH.

use crate::encode::config::{EncodeConfig, VideoCodec};
use crate::transport::shell_quote;
use std::path::Path;

/// A runnable encoder command and the file it will produce.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output_path: String,
}

impl EncodeCommand {
    /// Render as a single shell line with every argument quoted.
    pub fn to_shell(&self) -> String {
        let mut line = shell_quote(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

/// Produces the encoder command for an input path.
///
/// `output_path` overrides the derived output location, which the executor uses for manual
/// jobs and for staging directories.
pub trait EncoderInvocation: Send + Sync {
    fn build(&self, config: &EncodeConfig, input_path: &str, output_path: Option<&str>)
        -> EncodeCommand;

    /// Where the output lands when no explicit path is given.
    fn output_path(&self, config: &EncodeConfig, input_path: &str) -> String;
}

const RESOLUTIONS: [(&str, &str); 6] = [
    ("4K", "3840:2160"),
    ("2160p", "3840:2160"),
    ("1080p", "1920:1080"),
    ("720p", "1280:720"),
    ("480p", "854:480"),
    ("SD", "640:480"),
];

const TONEMAP_FILTER: &str =
    "zscale=t=linear:npl=100,format=gbrpf32le,zscale=p=bt709:t=bt709:m=bt709:r=tv,format=yuv420p";

/// ffmpeg command builder.
#[derive(Debug, Clone)]
pub struct FfmpegInvocation {
    pub ffmpeg_path: String,
    /// Inserted before the container extension of derived outputs.
    pub output_tag: String,
}

impl Default for FfmpegInvocation {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            output_tag: "fleetcode".to_string(),
        }
    }
}

impl FfmpegInvocation {
    pub fn new(ffmpeg_path: impl Into<String>, output_tag: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            output_tag: output_tag.into(),
        }
    }

    /// `/m/Movie.mkv` -> `/m/Movie.fleetcode.mkv` (container from config).
    pub fn derived_output_path(&self, input_path: &str, container: &str) -> String {
        let path = Path::new(input_path);
        let base = match path.extension() {
            Some(_) => path.with_extension(""),
            None => path.to_path_buf(),
        };
        format!("{}.{}.{}", base.to_string_lossy(), self.output_tag, container)
    }

    fn video_args(&self, config: &EncodeConfig, args: &mut Vec<String>) {
        let codec = config.video_codec;
        args.extend(["-c:v".to_string(), codec.as_str().to_string()]);

        let tonemap = config.str_option("hdr_mode") == Some("tonemap");
        let scale = config
            .str_option("target_resolution")
            .and_then(|res| RESOLUTIONS.iter().find(|(name, _)| *name == res))
            .map(|(_, dims)| format!("scale={}:flags=lanczos", dims));

        let mut filters = Vec::new();
        if tonemap {
            filters.push(TONEMAP_FILTER.to_string());
        }
        if let Some(scale) = scale {
            filters.push(scale);
        }
        if !filters.is_empty() {
            args.extend(["-vf".to_string(), filters.join(",")]);
        }

        let pix_fmt = if tonemap { "yuv420p" } else { codec.pix_fmt() };
        args.extend(["-pix_fmt".to_string(), pix_fmt.to_string()]);

        match config.str_option("bitrate_mode").unwrap_or("crf") {
            "cbr" => {
                let bitrate = config.str_option("target_bitrate").unwrap_or("8M");
                args.extend([
                    "-b:v".to_string(),
                    bitrate.to_string(),
                    "-maxrate".to_string(),
                    bitrate.to_string(),
                    "-bufsize".to_string(),
                    double_bitrate(bitrate),
                ]);
            }
            "vbr" => {
                let bitrate = config.str_option("target_bitrate").unwrap_or("8M");
                args.extend(["-b:v".to_string(), bitrate.to_string()]);
            }
            _ => {
                let quality = config.u64_option("crf_value").unwrap_or(23);
                args.extend([quality_flag(codec).to_string(), quality.to_string()]);
            }
        }

        if let Some(preset) = config.str_option("preset") {
            args.extend(["-preset".to_string(), preset.to_string()]);
        }

        if let Some(tune) = &config.encoder_tune {
            if codec.supports_tune(tune) {
                args.extend(["-tune".to_string(), tune.clone()]);
            }
        }
    }

    fn audio_args(&self, config: &EncodeConfig, args: &mut Vec<String>) {
        match config.str_option("audio_mode").unwrap_or("copy") {
            "transcode" => {
                let codec = config.str_option("audio_codec").unwrap_or("aac");
                args.extend(["-c:a".to_string(), codec.to_string()]);
                match codec {
                    "aac" => args.extend(["-b:a".to_string(), "192k".to_string()]),
                    "libopus" => args.extend(["-b:a".to_string(), "128k".to_string()]),
                    _ => {}
                }
            }
            "downmix" => args.extend(
                ["-c:a", "aac", "-ac", "2", "-b:a", "192k"]
                    .iter()
                    .map(|s| s.to_string()),
            ),
            _ => args.extend(["-c:a".to_string(), "copy".to_string()]),
        }
    }

    fn subtitle_args(&self, config: &EncodeConfig, args: &mut Vec<String>) {
        match config.str_option("subtitle_mode").unwrap_or("copy") {
            "remove" => args.push("-sn".to_string()),
            "burn" => {}
            _ => args.extend(["-c:s".to_string(), "copy".to_string()]),
        }
    }
}

impl EncoderInvocation for FfmpegInvocation {
    fn build(
        &self,
        config: &EncodeConfig,
        input_path: &str,
        output_path: Option<&str>,
    ) -> EncodeCommand {
        let mut args = vec!["-y".to_string()];

        if let Some(hw) = config.hw_accel {
            args.extend(hw.input_args().iter().map(|s| s.to_string()));
        }

        args.extend(["-i".to_string(), input_path.to_string()]);
        args.extend(["-map".to_string(), "0".to_string()]);

        self.video_args(config, &mut args);
        self.audio_args(config, &mut args);
        self.subtitle_args(config, &mut args);

        if let Some(flags) = config.str_option("custom_flags") {
            args.extend(flags.split_whitespace().map(str::to_string));
        }

        let output_path = output_path
            .map(str::to_string)
            .unwrap_or_else(|| self.output_path(config, input_path));
        args.push(output_path.clone());

        EncodeCommand {
            program: self.ffmpeg_path.clone(),
            args,
            output_path,
        }
    }

    fn output_path(&self, config: &EncodeConfig, input_path: &str) -> String {
        self.derived_output_path(input_path, &config.container)
    }
}

/// Constant-quality flag per encoder family.
fn quality_flag(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::HevcNvenc | VideoCodec::H264Nvenc | VideoCodec::Av1Nvenc => "-cq",
        VideoCodec::HevcQsv | VideoCodec::H264Qsv => "-global_quality",
        VideoCodec::HevcVideotoolbox | VideoCodec::H264Videotoolbox => "-q:v",
        VideoCodec::Libx265 | VideoCodec::Libx264 | VideoCodec::LibSvtAv1 => "-crf",
    }
}

/// `"8M"` -> `"16M"`; unparsable values pass through unchanged.
fn double_bitrate(bitrate: &str) -> String {
    let unit_at = bitrate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(bitrate.len());
    let (digits, unit) = bitrate.split_at(unit_at);
    match digits.parse::<u64>() {
        Ok(n) => format!("{}{}", n * 2, unit),
        Err(_) => bitrate.to_string(),
    }
}
