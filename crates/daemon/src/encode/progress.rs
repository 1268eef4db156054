//! Encoder output parsing: progress lines, log tail, hardware failure signatures.

use std::collections::VecDeque;

/// Lines kept for failure diagnostics.
pub const LOG_TAIL_LINES: usize = 100;

/// Substrings in encoder output that mean the GPU path is unusable on this host.
const HARDWARE_FAILURE_SIGNATURES: [&str; 7] = [
    "no CUDA-capable device",
    "CUDA_ERROR",
    "nvenc API version",
    "minimum required Nvidia driver",
    "Cannot load libcuda",
    "device type cuda needed",
    "OpenEncodeSessionEx failed",
];

/// One parsed ffmpeg status line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// Output timestamp reached so far.
    pub time_secs: Option<f64>,
    /// Realtime multiplier, e.g. `1.5` for `speed=1.5x`.
    pub speed: Option<f64>,
}

impl ProgressUpdate {
    /// Completion percentage against the source duration, capped at 100.
    pub fn percent(&self, total_secs: Option<f64>) -> Option<f64> {
        let total = total_secs.filter(|t| *t > 0.0)?;
        let current = self.time_secs?;
        Some((current / total * 100.0).clamp(0.0, 100.0))
    }

    /// Remaining seconds. Uses the reported speed, or fps against 24 fps content.
    pub fn eta_secs(&self, total_secs: Option<f64>) -> Option<u64> {
        let total = total_secs.filter(|t| *t > 0.0)?;
        let current = self.time_secs?;
        let remaining = (total - current).max(0.0);
        let rate = match self.speed {
            Some(speed) if speed > 0.0 => speed,
            _ => (self.fps? / 24.0).max(0.01),
        };
        Some((remaining / rate).round() as u64)
    }
}

/// Parse an ffmpeg status line. Returns `None` for ordinary log lines.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    if !line.contains("time=") || !(line.contains("frame=") || line.contains("speed=")) {
        return None;
    }

    // ffmpeg pads values after '=' with spaces: "frame=  120 fps= 24"
    let mut compact = line.to_string();
    while compact.contains("= ") {
        compact = compact.replace("= ", "=");
    }

    let mut update = ProgressUpdate::default();
    for token in compact.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "frame" => update.frame = value.parse().ok(),
            "fps" => update.fps = value.parse().ok(),
            "time" => update.time_secs = parse_timestamp(value),
            "speed" => update.speed = value.trim_end_matches('x').parse().ok(),
            _ => {}
        }
    }

    if update.time_secs.is_none() && update.frame.is_none() {
        return None;
    }
    Some(update)
}

/// `HH:MM:SS.ss` -> seconds. Negative timestamps (`-00:00:00.02`) at stream start read as 0.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    if value.starts_with('-') {
        return Some(0.0);
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Whether encoder output shows a hardware driver/SDK failure.
pub fn is_hardware_failure(output: &str) -> bool {
    HARDWARE_FAILURE_SIGNATURES
        .iter()
        .any(|sig| output.contains(sig))
}

/// Bounded buffer of the most recent log lines.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new(LOG_TAIL_LINES)
    }
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn joined(&self) -> String {
        self.to_vec().join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_padded_status_line() {
        let line = "frame=  240 fps= 48 q=28.0 size=    1024kB time=00:00:10.01 bitrate= 838.1kbits/s speed=2.00x";
        let update = parse_progress_line(line).unwrap();
        assert_eq!(update.frame, Some(240));
        assert_eq!(update.fps, Some(48.0));
        assert!((update.time_secs.unwrap() - 10.01).abs() < 1e-9);
        assert_eq!(update.speed, Some(2.0));
    }

    #[test]
    fn test_plain_log_line_is_not_progress() {
        assert!(parse_progress_line("Stream #0:0: Video: hevc (Main 10)").is_none());
        assert!(parse_progress_line("[hevc_nvenc @ 0x5] OpenEncodeSessionEx failed").is_none());
    }

    #[test]
    fn test_percent_and_eta() {
        let update = ProgressUpdate {
            frame: Some(100),
            fps: Some(48.0),
            time_secs: Some(30.0),
            speed: None,
        };
        assert_eq!(update.percent(Some(120.0)), Some(25.0));
        // (120 - 30) / (48 / 24)
        assert_eq!(update.eta_secs(Some(120.0)), Some(45));
        assert_eq!(update.percent(None), None);

        let with_speed = ProgressUpdate {
            speed: Some(3.0),
            ..update
        };
        assert_eq!(with_speed.eta_secs(Some(120.0)), Some(30));
    }

    #[test]
    fn test_negative_timestamp_reads_zero() {
        assert_eq!(parse_timestamp("-00:00:00.02"), Some(0.0));
        assert_eq!(parse_timestamp("01:02:03.5"), Some(3723.5));
        assert_eq!(parse_timestamp("N/A"), None);
    }

    #[test]
    fn test_hardware_failure_signatures() {
        assert!(is_hardware_failure(
            "[hevc_nvenc @ 0x1] Driver does not support the required nvenc API version. Required: 12.1"
        ));
        assert!(is_hardware_failure("CUDA_ERROR_NO_DEVICE"));
        assert!(!is_hardware_failure("Conversion failed!"));
    }

    proptest! {
        #[test]
        fn prop_log_tail_keeps_last_lines(count in 0usize..400) {
            let mut tail = LogTail::default();
            for i in 0..count {
                tail.push(format!("line {}", i));
            }
            prop_assert_eq!(tail.len(), count.min(LOG_TAIL_LINES));
            if count > 0 {
                let lines = tail.to_vec();
                prop_assert_eq!(lines.last().cloned(), Some(format!("line {}", count - 1)));
            }
        }

        #[test]
        fn prop_percent_never_exceeds_hundred(time in 0.0f64..1e6, total in 0.1f64..1e6) {
            let update = ProgressUpdate { time_secs: Some(time), ..ProgressUpdate::default() };
            let pct = update.percent(Some(total)).unwrap();
            prop_assert!((0.0..=100.0).contains(&pct));
        }
    }
}
