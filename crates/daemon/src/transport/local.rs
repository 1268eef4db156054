use super::{ByteProgress, Direction, Transport, TransportError};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// The machine the scheduler runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        "local".to_string()
    }

    fn shell_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        // own process group, so cancelling a shell also stops the encoder it started
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn test_connection(&self) -> bool {
        true
    }

    async fn bulk_copy(
        &self,
        direction: Direction,
        local: &Path,
        remote: &str,
        progress: ByteProgress<'_>,
    ) -> Result<(), TransportError> {
        let copied = match direction {
            Direction::Upload => tokio::fs::copy(local, remote).await?,
            Direction::Download => tokio::fs::copy(remote, local).await?,
        };
        progress(copied);
        Ok(())
    }
}
