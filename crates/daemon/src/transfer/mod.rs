//! File transfer strategies.
//!
//! [`TransferEngine::transfer`] walks a ladder and the first strategy that succeeds wins:
//!
//! 1. parallel segmented copy over independent connections (large files only)
//! 2. the transport's bulk copy tool
//! 3. a chunked read/write loop through a plain byte stream
//!
//! [`TransferEngine::relay`] streams between two hosts without touching local disk.

mod progress;
mod relay;
mod segment;

pub use progress::{no_progress, ProgressFn, ProgressThrottle, TransferProgress};
pub use segment::{plan_segments, Segment};

use crate::config::TransferConfig;
use crate::transport::{Direction, Transport, TransportError, BLOCK_SIZE};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source not found: {0}")]
    SourceMissing(String),

    #[error("size mismatch after transfer: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment {index} failed: {source}")]
    Segment {
        index: usize,
        #[source]
        source: Box<TransferError>,
    },

    #[error("all transfer strategies failed; last error: {0}")]
    Exhausted(#[source] Box<TransferError>),

    #[error("transfer aborted: {0}")]
    Aborted(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Output of the command behind the failure, if a command failed.
    pub fn output_lines(&self) -> Vec<String> {
        match self {
            TransferError::Transport(e) => e.output_lines(),
            TransferError::Segment { source, .. } => source.output_lines(),
            TransferError::Exhausted(last) => last.output_lines(),
            _ => Vec::new(),
        }
    }
}

/// Which rung of the ladder moved the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ParallelSegments,
    BulkCopy,
    Chunked,
    Relay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub strategy: Strategy,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Tunables of the transfer ladder.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub parallel_threshold: u64,
    pub segments: usize,
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub relay_queue_depth: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for TransferSettings {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            parallel_threshold: cfg.parallel_threshold_bytes,
            segments: cfg.segments.max(1) as usize,
            chunk_size: cfg.chunk_size_bytes.max(1),
            progress_interval: Duration::from_millis(cfg.progress_poll_ms),
            relay_queue_depth: cfg.relay_queue_depth.max(1),
        }
    }
}

/// One file move between the local machine and a transport's host.
struct FileMove<'a> {
    transport: &'a Arc<dyn Transport>,
    direction: Direction,
    local: &'a Path,
    remote: &'a str,
    size: u64,
}

impl FileMove<'_> {
    async fn destination_size(&self) -> Result<Option<u64>, TransferError> {
        match self.direction {
            Direction::Upload => Ok(self.transport.file_size(self.remote).await?),
            Direction::Download => match tokio::fs::metadata(self.local).await {
                Ok(meta) => Ok(Some(meta.len())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn verify_size(&self) -> Result<(), TransferError> {
        let actual = self.destination_size().await?.unwrap_or(0);
        if actual != self.size {
            return Err(TransferError::SizeMismatch {
                expected: self.size,
                actual,
            });
        }
        Ok(())
    }

    /// Bytes physically written to the destination so far.
    async fn written_bytes(&self) -> u64 {
        match self.direction {
            Direction::Upload => self.transport.written_bytes(self.remote).await.unwrap_or(0),
            Direction::Download => local_written_bytes(self.local),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    settings: TransferSettings,
}

impl TransferEngine {
    pub fn new(settings: TransferSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Move one file between `local` and `remote` on `transport`'s host.
    pub async fn transfer(
        &self,
        transport: &Arc<dyn Transport>,
        direction: Direction,
        local: &Path,
        remote: &str,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        let size = match direction {
            Direction::Upload => tokio::fs::metadata(local)
                .await
                .map_err(|_| TransferError::SourceMissing(local.display().to_string()))?
                .len(),
            Direction::Download => transport
                .file_size(remote)
                .await?
                .ok_or_else(|| TransferError::SourceMissing(remote.to_string()))?,
        };

        match direction {
            Direction::Upload => {
                if let Some(parent) = remote_parent(remote) {
                    transport.ensure_dir(&parent).await?;
                }
            }
            Direction::Download => {
                if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let job = FileMove {
            transport,
            direction,
            local,
            remote,
            size,
        };
        info!(
            host = %transport.describe(),
            direction = direction.as_str(),
            local = %local.display(),
            remote,
            size,
            "starting transfer"
        );

        let mut last_error = String::new();

        if size >= self.settings.parallel_threshold && self.settings.segments > 1 {
            let mut throttle =
                ProgressThrottle::new(progress.clone(), size, self.settings.progress_interval);
            match self.parallel(&job, &mut throttle, cancel).await {
                Ok(()) => {
                    throttle.finish();
                    return Ok(self.outcome(Strategy::ParallelSegments, size, started));
                }
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "parallel transfer failed, falling back to bulk copy");
                    last_error = e.to_string();
                }
            }
        }

        let mut throttle =
            ProgressThrottle::new(progress.clone(), size, self.settings.progress_interval);
        match self.bulk(&job, &mut throttle, cancel).await {
            Ok(()) => {
                throttle.finish();
                return Ok(self.outcome(Strategy::BulkCopy, size, started));
            }
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(TransferError::Transport(e)) if e.is_operation_not_supported() => {
                info!(error = %e, "destination rejected bulk copy, using chunked copy");
                last_error = e.to_string();
            }
            Err(TransferError::Transport(TransportError::Unsupported(what))) => {
                debug!(what, "transport has no bulk copy");
            }
            Err(e) => {
                warn!(error = %e, "bulk copy failed, falling back to chunked copy");
                last_error = e.to_string();
            }
        }

        let mut throttle = ProgressThrottle::new(progress, size, self.settings.progress_interval);
        match self.chunked(&job, &mut throttle, cancel).await {
            Ok(()) => {
                throttle.finish();
                Ok(self.outcome(Strategy::Chunked, size, started))
            }
            Err(TransferError::Cancelled) => Err(TransferError::Cancelled),
            Err(e) => {
                warn!(error = %e, previous = %last_error, "chunked copy failed");
                Err(TransferError::Exhausted(Box::new(e)))
            }
        }
    }

    fn outcome(&self, strategy: Strategy, bytes: u64, started: Instant) -> TransferOutcome {
        let elapsed = started.elapsed();
        debug!(?strategy, bytes, ?elapsed, "transfer finished");
        TransferOutcome {
            strategy,
            bytes,
            elapsed,
        }
    }

    async fn parallel(
        &self,
        job: &FileMove<'_>,
        throttle: &mut ProgressThrottle,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let segments = plan_segments(job.size, self.settings.segments, BLOCK_SIZE);
        debug!(segments = segments.len(), "preallocating destination");

        match job.direction {
            Direction::Upload => job.transport.preallocate(job.remote, job.size).await?,
            Direction::Download => {
                let file = tokio::fs::File::create(job.local).await?;
                file.set_len(job.size).await?;
            }
        }

        let mut set = JoinSet::new();
        for segment in segments {
            let transport = job.transport.clone();
            let local = job.local.to_path_buf();
            let remote = job.remote.to_string();
            let direction = job.direction;
            set.spawn(async move {
                move_segment(transport, direction, local, remote, segment)
                    .await
                    .map_err(|e| TransferError::Segment {
                        index: segment.index,
                        source: Box::new(e),
                    })
            });
        }

        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => return Err(e),
                    Some(Err(e)) => return Err(TransferError::Aborted(e.to_string())),
                },
                _ = ticker.tick() => {
                    let written = job.written_bytes().await;
                    throttle.update(written.min(job.size));
                }
            }
        }

        job.verify_size().await
    }

    async fn bulk(
        &self,
        job: &FileMove<'_>,
        throttle: &mut ProgressThrottle,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut on_bytes = |bytes: u64| throttle.update(bytes);
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            result = job.transport.bulk_copy(job.direction, job.local, job.remote, &mut on_bytes) => result?,
        }
        job.verify_size().await
    }

    async fn chunked(
        &self,
        job: &FileMove<'_>,
        throttle: &mut ProgressThrottle,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut buf = vec![0u8; self.settings.chunk_size];
        let mut moved = 0u64;
        match job.direction {
            Direction::Upload => {
                let mut file = tokio::fs::File::open(job.local).await?;
                let mut sink = job.transport.open_writer(job.remote, None).await?;
                loop {
                    if cancel.is_cancelled() {
                        return Err(TransferError::Cancelled);
                    }
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    sink.writer().write_all(&buf[..n]).await?;
                    moved += n as u64;
                    throttle.update(moved);
                }
                sink.finish().await?;
            }
            Direction::Download => {
                let mut source = job.transport.open_reader(job.remote, 0, None).await?;
                let mut file = tokio::fs::File::create(job.local).await?;
                loop {
                    if cancel.is_cancelled() {
                        return Err(TransferError::Cancelled);
                    }
                    let n = source.reader().read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buf[..n]).await?;
                    moved += n as u64;
                    throttle.update(moved);
                }
                file.flush().await?;
                source.finish().await?;
            }
        }
        job.verify_size().await
    }
}

async fn move_segment(
    transport: Arc<dyn Transport>,
    direction: Direction,
    local: PathBuf,
    remote: String,
    segment: Segment,
) -> Result<(), TransferError> {
    match direction {
        Direction::Upload => {
            let mut file = tokio::fs::File::open(&local).await?;
            file.seek(SeekFrom::Start(segment.start)).await?;
            let mut reader = file.take(segment.len());
            let mut sink = transport.open_writer(&remote, Some(segment.start)).await?;
            tokio::io::copy(&mut reader, sink.writer()).await?;
            sink.finish().await?;
        }
        Direction::Download => {
            let mut source = transport
                .open_reader(&remote, segment.start, Some(segment.len()))
                .await?;
            let mut file = tokio::fs::OpenOptions::new().write(true).open(&local).await?;
            file.seek(SeekFrom::Start(segment.start)).await?;
            let copied = tokio::io::copy(source.reader(), &mut file).await?;
            file.flush().await?;
            source.finish().await?;
            if copied != segment.len() {
                return Err(TransferError::SizeMismatch {
                    expected: segment.len(),
                    actual: copied,
                });
            }
        }
    }
    Ok(())
}

/// Parent directory of a POSIX path on a remote host.
pub(crate) fn remote_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(trimmed[..idx].to_string())
}

fn local_written_bytes(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        #[cfg(unix)]
        Ok(meta) => {
            use std::os::unix::fs::MetadataExt;
            meta.blocks() * 512
        }
        #[cfg(not(unix))]
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}
