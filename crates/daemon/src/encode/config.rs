//! Encode configuration and codec capability tables.
//!
//! The configuration arrives fully resolved. The scheduler only looks at the codec,
//! hardware decode, tune and container; every other key passes through untouched.

use crate::workers::HardwareFamily;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Video encoders the scheduler knows how to reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    Libx265,
    Libx264,
    #[serde(rename = "libsvtav1")]
    LibSvtAv1,
    HevcNvenc,
    H264Nvenc,
    Av1Nvenc,
    HevcQsv,
    H264Qsv,
    HevcVideotoolbox,
    H264Videotoolbox,
}

impl VideoCodec {
    pub const ALL: [VideoCodec; 10] = [
        VideoCodec::Libx265,
        VideoCodec::Libx264,
        VideoCodec::LibSvtAv1,
        VideoCodec::HevcNvenc,
        VideoCodec::H264Nvenc,
        VideoCodec::Av1Nvenc,
        VideoCodec::HevcQsv,
        VideoCodec::H264Qsv,
        VideoCodec::HevcVideotoolbox,
        VideoCodec::H264Videotoolbox,
    ];

    /// ffmpeg encoder name.
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::Libx265 => "libx265",
            VideoCodec::Libx264 => "libx264",
            VideoCodec::LibSvtAv1 => "libsvtav1",
            VideoCodec::HevcNvenc => "hevc_nvenc",
            VideoCodec::H264Nvenc => "h264_nvenc",
            VideoCodec::Av1Nvenc => "av1_nvenc",
            VideoCodec::HevcQsv => "hevc_qsv",
            VideoCodec::H264Qsv => "h264_qsv",
            VideoCodec::HevcVideotoolbox => "hevc_videotoolbox",
            VideoCodec::H264Videotoolbox => "h264_videotoolbox",
        }
    }

    /// Hardware family the encoder needs, `None` for software encoders.
    pub fn hardware_family(&self) -> Option<HardwareFamily> {
        match self {
            VideoCodec::Libx265 | VideoCodec::Libx264 | VideoCodec::LibSvtAv1 => None,
            VideoCodec::HevcNvenc | VideoCodec::H264Nvenc | VideoCodec::Av1Nvenc => {
                Some(HardwareFamily::Nvenc)
            }
            VideoCodec::HevcQsv | VideoCodec::H264Qsv => Some(HardwareFamily::Qsv),
            VideoCodec::HevcVideotoolbox | VideoCodec::H264Videotoolbox => {
                Some(HardwareFamily::Videotoolbox)
            }
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.hardware_family().is_some()
    }

    /// The 1:1 software encoder producing the same format.
    pub fn software_equivalent(&self) -> VideoCodec {
        match self {
            VideoCodec::HevcNvenc | VideoCodec::HevcQsv | VideoCodec::HevcVideotoolbox => {
                VideoCodec::Libx265
            }
            VideoCodec::H264Nvenc | VideoCodec::H264Qsv | VideoCodec::H264Videotoolbox => {
                VideoCodec::Libx264
            }
            VideoCodec::Av1Nvenc => VideoCodec::LibSvtAv1,
            software => *software,
        }
    }

    /// NVENC encoder producing the same format, for software encoders that have one.
    pub fn nvenc_equivalent(&self) -> Option<VideoCodec> {
        match self {
            VideoCodec::Libx265 => Some(VideoCodec::HevcNvenc),
            VideoCodec::Libx264 => Some(VideoCodec::H264Nvenc),
            VideoCodec::LibSvtAv1 => Some(VideoCodec::Av1Nvenc),
            _ => None,
        }
    }

    /// Default pixel format for this encoder.
    pub fn pix_fmt(&self) -> &'static str {
        match self {
            VideoCodec::Libx265 | VideoCodec::LibSvtAv1 => "yuv420p10le",
            VideoCodec::Libx264 | VideoCodec::H264Nvenc => "yuv420p",
            VideoCodec::HevcNvenc | VideoCodec::Av1Nvenc => "p010le",
            VideoCodec::HevcQsv
            | VideoCodec::H264Qsv
            | VideoCodec::HevcVideotoolbox
            | VideoCodec::H264Videotoolbox => "nv12",
        }
    }

    /// Whether `-tune <value>` is understood by this encoder.
    pub fn supports_tune(&self, tune: &str) -> bool {
        match self {
            VideoCodec::HevcNvenc | VideoCodec::H264Nvenc | VideoCodec::Av1Nvenc => {
                NVENC_TUNES.contains(&tune)
            }
            VideoCodec::Libx264 => X264_TUNES.contains(&tune),
            VideoCodec::Libx265 => X265_TUNES.contains(&tune),
            VideoCodec::LibSvtAv1
            | VideoCodec::HevcQsv
            | VideoCodec::H264Qsv
            | VideoCodec::HevcVideotoolbox
            | VideoCodec::H264Videotoolbox => false,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VideoCodec::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown video codec '{}'", s))
    }
}

const NVENC_TUNES: [&str; 4] = ["hq", "ll", "ull", "lossless"];
const X264_TUNES: [&str; 8] = [
    "film",
    "animation",
    "grain",
    "stillimage",
    "fastdecode",
    "zerolatency",
    "psnr",
    "ssim",
];
const X265_TUNES: [&str; 6] = ["grain", "animation", "fastdecode", "zerolatency", "psnr", "ssim"];

/// Hardware-accelerated decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    #[serde(alias = "nvenc")]
    Cuda,
    Qsv,
    Videotoolbox,
}

impl HwAccel {
    /// ffmpeg input arguments enabling this decoder.
    pub fn input_args(&self) -> &'static [&'static str] {
        match self {
            HwAccel::Cuda => &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"],
            HwAccel::Qsv => &["-hwaccel", "qsv"],
            HwAccel::Videotoolbox => &["-hwaccel", "videotoolbox"],
        }
    }

    pub fn for_family(family: HardwareFamily) -> HwAccel {
        match family {
            HardwareFamily::Nvenc => HwAccel::Cuda,
            HardwareFamily::Qsv => HwAccel::Qsv,
            HardwareFamily::Videotoolbox => HwAccel::Videotoolbox,
        }
    }
}

/// Resolved encode configuration for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeConfig {
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_accel: Option<HwAccel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_tune: Option<String>,
    #[serde(default = "default_container")]
    pub container: String,
    /// Every other key, passed through to the command builder.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_container() -> String {
    "mkv".to_string()
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            video_codec: VideoCodec::default(),
            hw_accel: None,
            encoder_tune: None,
            container: default_container(),
            extra: Map::new(),
        }
    }
}

impl EncodeConfig {
    pub fn str_option(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn u64_option(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    /// Drops the tune value when the current encoder would reject it.
    pub fn strip_incompatible_tune(&mut self) -> Option<String> {
        match &self.encoder_tune {
            Some(tune) if !self.video_codec.supports_tune(tune) => self.encoder_tune.take(),
            _ => None,
        }
    }

    /// Same configuration with software decode.
    pub fn with_software_decode(&self) -> EncodeConfig {
        let mut next = self.clone();
        next.hw_accel = None;
        next
    }

    /// Same configuration on the software encoder, software decode, compatible tune.
    pub fn with_software_encoder(&self) -> EncodeConfig {
        let mut next = self.with_software_decode();
        next.video_codec = self.video_codec.software_equivalent();
        next.strip_incompatible_tune();
        next
    }

    /// Upgrade a software codec to NVENC for a GPU worker. Returns whether anything changed.
    pub fn upgrade_to_nvenc(&mut self) -> bool {
        match self.video_codec.nvenc_equivalent() {
            Some(hw) => {
                self.video_codec = hw;
                self.strip_incompatible_tune();
                true
            }
            None => false,
        }
    }
}
