//! Output validation.
//!
//! Every encode is checked before anything replaces the original: the output must probe,
//! carry a decodable video stream, clear a size floor and match the source duration.

use crate::config::ValidationConfig;
use crate::probe::ProbeResult;
use serde::{Deserialize, Serialize};

/// Result of validating an encoded output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationResult {
    Pass,
    Reject { reason: String },
}

impl ValidationResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, ValidationResult::Pass)
    }

    fn reject(reason: impl Into<String>) -> Self {
        ValidationResult::Reject {
            reason: reason.into(),
        }
    }
}

/// Check a probed output against the source.
///
/// # Arguments
/// * `probe` - ffprobe result for the output, `None` when probing failed
/// * `output_bytes` - Size of the output file; falls back to the probed size when absent
/// * `source_duration` - Source duration in seconds, when known
/// * `cfg` - Size floor and duration tolerance
pub fn validate_output(
    probe: Option<&ProbeResult>,
    output_bytes: Option<u64>,
    source_duration: Option<f64>,
    cfg: &ValidationConfig,
) -> ValidationResult {
    let Some(probe) = probe else {
        return ValidationResult::reject("output could not be probed");
    };

    let Some(video) = probe.video_streams.first() else {
        return ValidationResult::reject("output has no video stream");
    };
    if video.codec_name.is_empty() || video.width == 0 || video.height == 0 {
        return ValidationResult::reject(format!(
            "video stream is not decodable ({} {}x{})",
            video.codec_name, video.width, video.height
        ));
    }

    let size = output_bytes.unwrap_or(probe.format.size_bytes);
    if size < cfg.min_output_bytes {
        return ValidationResult::reject(format!(
            "output is {} bytes, below the {} byte floor",
            size, cfg.min_output_bytes
        ));
    }

    if let Some(expected) = source_duration.filter(|d| *d > 0.0) {
        let Some(actual) = probe.duration() else {
            return ValidationResult::reject("output has no duration");
        };
        let drift = (actual - expected).abs();
        if drift > cfg.duration_tolerance_secs {
            return ValidationResult::reject(format!(
                "duration {:.2}s differs from source {:.2}s by {:.2}s",
                actual, expected, drift
            ));
        }
    }

    ValidationResult::Pass
}
