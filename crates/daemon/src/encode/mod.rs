//! Encoder configuration, command construction and output parsing

pub mod command;
pub mod config;
pub mod progress;

pub use command::{EncodeCommand, EncoderInvocation, FfmpegInvocation};
pub use config::{EncodeConfig, HwAccel, VideoCodec};
pub use progress::{
    is_hardware_failure, parse_progress_line, parse_timestamp, LogTail, ProgressUpdate,
    LOG_TAIL_LINES,
};
