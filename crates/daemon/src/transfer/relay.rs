//! Host-to-host streaming through the scheduler's memory.

use super::{remote_parent, ProgressFn, ProgressThrottle, Strategy, TransferEngine, TransferError, TransferOutcome};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

impl TransferEngine {
    /// Copy `src` on `from` to `dst` on `to`.
    ///
    /// A reader task fills a bounded queue of chunks and a writer drains it; `None` marks
    /// the end of the stream. A reader failure is reported after the writer has drained
    /// what was already queued.
    pub async fn relay(
        &self,
        from: &Arc<dyn Transport>,
        src: &str,
        to: &Arc<dyn Transport>,
        dst: &str,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        let size = from
            .file_size(src)
            .await?
            .ok_or_else(|| TransferError::SourceMissing(src.to_string()))?;
        if let Some(parent) = remote_parent(dst) {
            to.ensure_dir(&parent).await?;
        }
        info!(
            from = %from.describe(),
            to = %to.describe(),
            src,
            dst,
            size,
            "starting relay"
        );

        let (tx, mut rx) = mpsc::channel::<Option<Vec<u8>>>(self.settings.relay_queue_depth);
        let chunk_size = self.settings.chunk_size;
        let reader_host = from.clone();
        let reader_src = src.to_string();
        let reader = tokio::spawn(async move {
            let mut source = reader_host.open_reader(&reader_src, 0, None).await?;
            loop {
                let mut chunk = vec![0u8; chunk_size];
                let n = source.reader().read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                chunk.truncate(n);
                if tx.send(Some(chunk)).await.is_err() {
                    // writer gone, its error wins
                    return Ok(());
                }
            }
            source.finish().await?;
            let _ = tx.send(None).await;
            Ok::<(), TransferError>(())
        });
        let abort = reader.abort_handle();

        let mut throttle = ProgressThrottle::new(progress, size, self.settings.progress_interval);
        let written = async {
            let mut sink = to.open_writer(dst, None).await?;
            let mut moved = 0u64;
            let mut saw_end = false;
            while let Some(message) = rx.recv().await {
                match message {
                    Some(chunk) => {
                        sink.writer().write_all(&chunk).await?;
                        moved += chunk.len() as u64;
                        throttle.update(moved);
                    }
                    None => {
                        saw_end = true;
                        break;
                    }
                }
            }
            sink.finish().await?;
            Ok::<(u64, bool), TransferError>((moved, saw_end))
        };

        let writer_result = tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                return Err(TransferError::Cancelled);
            }
            result = written => result,
        };

        let (moved, saw_end) = match writer_result {
            Ok(done) => done,
            Err(e) => {
                abort.abort();
                warn!(error = %e, "relay writer failed");
                return Err(e);
            }
        };

        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(TransferError::Aborted(e.to_string())),
        }
        if !saw_end {
            return Err(TransferError::Aborted(
                "relay reader stopped without end of stream".to_string(),
            ));
        }

        let actual = to.file_size(dst).await?.unwrap_or(0);
        if actual != size || moved != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual,
            });
        }
        throttle.finish();
        Ok(TransferOutcome {
            strategy: Strategy::Relay,
            bytes: size,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::{no_progress, TransferSettings};
    use super::*;
    use crate::transport::LocalTransport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::process::Command;

    /// Local host whose whole-file reader stops after 10000 bytes and exits with an error.
    struct ShortRead;

    #[async_trait]
    impl Transport for ShortRead {
        fn describe(&self) -> String {
            "short-read".into()
        }

        fn shell_command(&self, command: &str) -> Command {
            if command.starts_with("cat ") && !command.contains('>') {
                return LocalTransport.shell_command(&format!(
                    "{command} | head -c 10000; echo 'read error on device' >&2; exit 5"
                ));
            }
            LocalTransport.shell_command(command)
        }
    }

    fn engine() -> TransferEngine {
        TransferEngine::new(TransferSettings {
            parallel_threshold: u64::MAX,
            segments: 4,
            chunk_size: 4096,
            progress_interval: Duration::from_millis(10),
            relay_queue_depth: 2,
        })
    }

    #[tokio::test]
    async fn test_relay_copies_between_hosts() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("origin/movie.mkv");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let dst = dir.path().join("worker/scratch/movie.mkv");

        let host: Arc<dyn Transport> = Arc::new(LocalTransport);
        let outcome = engine()
            .relay(
                &host,
                src.to_str().unwrap(),
                &host,
                dst.to_str().unwrap(),
                no_progress(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.strategy, Strategy::Relay);
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn test_relay_missing_source() {
        let dir = TempDir::new().unwrap();
        let host: Arc<dyn Transport> = Arc::new(LocalTransport);
        let err = engine()
            .relay(
                &host,
                dir.path().join("none.mkv").to_str().unwrap(),
                &host,
                dir.path().join("out.mkv").to_str().unwrap(),
                no_progress(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_reader_error_is_returned_after_queue_drains() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("movie.mkv");
        std::fs::write(&src, vec![7u8; 100_000]).unwrap();
        let dst = dir.path().join("copy.mkv");

        let from: Arc<dyn Transport> = Arc::new(ShortRead);
        let to: Arc<dyn Transport> = Arc::new(LocalTransport);
        let err = engine()
            .relay(
                &from,
                src.to_str().unwrap(),
                &to,
                dst.to_str().unwrap(),
                no_progress(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Transport(_)), "{:?}", err);
        assert!(err
            .output_lines()
            .iter()
            .any(|line| line == "read error on device"));
        // everything the reader queued reached the destination before the error surfaced
        assert_eq!(std::fs::read(&dst).unwrap(), vec![7u8; 10_000]);
    }
}
