//! Failure taxonomy of a job pipeline.

use crate::replace::ReplaceError;
use crate::store::StoreError;
use crate::transfer::TransferError;
use crate::transport::TransportError;
use thiserror::Error;

/// Why a job attempt ended without completing.
///
/// `log_tail` carries the last lines of encoder or command output where there is any.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("source not accessible: {0}")]
    SourceNotAccessible(String),

    #[error("transfer failed: {reason}")]
    TransferFailed {
        reason: String,
        log_tail: Vec<String>,
    },

    #[error("encode failed: {reason}")]
    EncodeFailed {
        reason: String,
        log_tail: Vec<String>,
    },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("replace failed: {reason}")]
    ReplaceFailed {
        reason: String,
        log_tail: Vec<String>,
    },

    #[error("cancelled by operator")]
    Cancelled,

    #[error("no progress for {minutes} minutes")]
    Stuck { minutes: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    /// Transient failures are retried with backoff; the rest are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::TransferFailed { .. }
            | JobError::EncodeFailed { .. }
            | JobError::Stuck { .. }
            | JobError::ReplaceFailed { .. }
            | JobError::Store(_) => true,
            JobError::SourceNotAccessible(_)
            | JobError::ValidationFailed(_)
            | JobError::Cancelled => false,
        }
    }

    pub fn log_tail(&self) -> Vec<String> {
        match self {
            JobError::EncodeFailed { log_tail, .. }
            | JobError::TransferFailed { log_tail, .. }
            | JobError::ReplaceFailed { log_tail, .. } => log_tail.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<TransferError> for JobError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Cancelled => JobError::Cancelled,
            other => JobError::TransferFailed {
                reason: other.to_string(),
                log_tail: other.output_lines(),
            },
        }
    }
}

impl From<TransportError> for JobError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => JobError::Cancelled,
            other => JobError::TransferFailed {
                reason: other.to_string(),
                log_tail: other.output_lines(),
            },
        }
    }
}

impl From<ReplaceError> for JobError {
    fn from(e: ReplaceError) -> Self {
        JobError::ReplaceFailed {
            reason: e.to_string(),
            log_tail: e.output_lines(),
        }
    }
}
