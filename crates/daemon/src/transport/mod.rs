//! Single-operation I/O against a host.
//!
//! A [`Transport`] knows how to start a shell command on its host. Everything else
//! (streamed commands, stat, preallocation, byte streams in and out of files) is built on
//! that one primitive, so the same code drives the local machine and SSH hosts. Every
//! call spawns its own process, which makes concurrent calls independent connections.

mod local;
mod ssh;

pub use local::LocalTransport;
pub use ssh::SshTransport;

use crate::config::HostConfig;
use crate::workers::Worker;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// Default timeout of one-shot commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Block size used for offset reads and writes. Segment boundaries are multiples of it.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

// EOPNOTSUPP on macOS and Linux
const EOPNOTSUPP_CODES: [i32; 2] = [45, 95];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command failed (exit {code:?}): {command}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("worker {0} has no host configured")]
    NoHost(String),
}

impl TransportError {
    /// stderr of a failed command, one entry per non-empty line.
    pub fn output_lines(&self) -> Vec<String> {
        match self {
            TransportError::CommandFailed { stderr, .. } => stderr
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The destination filesystem rejected the operation (typically a network share
    /// refusing large block writes).
    pub fn is_operation_not_supported(&self) -> bool {
        match self {
            TransportError::Io(e) | TransportError::Spawn { source: e, .. } => e
                .raw_os_error()
                .map_or(false, |code| EOPNOTSUPP_CODES.contains(&code)),
            TransportError::CommandFailed { stderr, .. } => {
                stderr.contains("Operation not supported")
            }
            _ => false,
        }
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn into_result(self, command: &str) -> Result<CommandOutput, TransportError> {
        if self.success() {
            Ok(self)
        } else {
            Err(TransportError::CommandFailed {
                command: command.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Direction of a file transfer relative to the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file to the transport's host.
    Upload,
    /// Transport's host to a local file.
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Callback receiving bytes moved so far.
pub type ByteProgress<'a> = &'a mut (dyn FnMut(u64) + Send);

/// Quote a string for POSIX `sh`. Safe strings pass through unchanged.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Splits a byte stream into lines on `\n` or `\r`. ffmpeg and rsync redraw their status
/// line with bare carriage returns.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(&str)) {
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.flush(&mut emit);
            } else {
                self.pending.push(b);
            }
        }
    }

    pub fn finish(&mut self, mut emit: impl FnMut(&str)) {
        self.flush(&mut emit);
    }

    fn flush(&mut self, emit: &mut impl FnMut(&str)) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            emit(trimmed);
        }
    }
}

/// Readable end of a remote file.
pub struct ByteSource {
    child: Child,
    stdout: ChildStdout,
    command: String,
}

impl ByteSource {
    pub fn reader(&mut self) -> &mut ChildStdout {
        &mut self.stdout
    }

    /// Wait for the producing process and surface its failure.
    pub async fn finish(mut self) -> Result<(), TransportError> {
        drop(self.stdout);
        let stderr = read_stderr(&mut self.child).await;
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::CommandFailed {
                command: self.command,
                code: status.code(),
                stderr,
            })
        }
    }
}

/// Writable end of a remote file.
pub struct ByteSink {
    child: Child,
    stdin: ChildStdin,
    command: String,
}

impl ByteSink {
    pub fn writer(&mut self) -> &mut ChildStdin {
        &mut self.stdin
    }

    /// Close the stream and wait for the consumer to flush it to disk.
    pub async fn finish(mut self) -> Result<(), TransportError> {
        self.stdin.shutdown().await?;
        drop(self.stdin);
        let stderr = read_stderr(&mut self.child).await;
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::CommandFailed {
                command: self.command,
                code: status.code(),
                stderr,
            })
        }
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf.trim().to_string()
}

/// Kill a child and, when it leads its own process group, everything it started.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", "--", &format!("-{}", pid)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    let _ = child.kill().await;
}

fn spawn(mut cmd: Command, command: &str) -> Result<Child, TransportError> {
    cmd.kill_on_drop(true).spawn().map_err(|e| TransportError::Spawn {
        program: command.split_whitespace().next().unwrap_or_default().to_string(),
        source: e,
    })
}

/// Access to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable host label for logs.
    fn describe(&self) -> String;

    /// A process that runs `command` through a POSIX shell on the host.
    fn shell_command(&self, command: &str) -> Command;

    async fn test_connection(&self) -> bool {
        match self
            .run_command("echo ok", Some(Duration::from_secs(15)))
            .await
        {
            Ok(out) => out.stdout.trim() == "ok",
            Err(_) => false,
        }
    }

    /// Run to completion and collect output. Non-zero exits are returned, not raised.
    async fn run_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = self.shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = spawn(cmd, command)?;
        let timeout = timeout.unwrap_or(COMMAND_TIMEOUT);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run with stdout and stderr merged, handing each line to `on_line` as it arrives.
    /// Cancelling the token kills the process.
    async fn run_command_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, TransportError> {
        let merged = format!("exec 2>&1; {}", command);
        let mut cmd = self.shell_command(&merged);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = spawn(cmd, command)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or(TransportError::Unsupported("stdout capture"))?;

        let mut splitter = LineSplitter::default();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Err(TransportError::Cancelled);
                }
                read = stdout.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            splitter.push(&buf[..n], |line| on_line(line));
        }
        splitter.finish(|line| on_line(line));

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(TransportError::Cancelled);
            }
            status = child.wait() => status?,
        };
        Ok(CommandOutput {
            exit_code: status.code(),
            ..CommandOutput::default()
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        let out = self
            .run_command(&format!("test -f {}", shell_quote(path)), None)
            .await?;
        Ok(out.success())
    }

    /// Apparent size, `None` when the file is missing.
    async fn file_size(&self, path: &str) -> Result<Option<u64>, TransportError> {
        let q = shell_quote(path);
        let out = self
            .run_command(
                &format!("stat -c %s {q} 2>/dev/null || stat -f %z {q} 2>/dev/null"),
                None,
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out.stdout.trim().parse().ok())
    }

    /// Bytes actually allocated on disk. For a sparse preallocated file this is what has
    /// been written so far.
    async fn written_bytes(&self, path: &str) -> Result<u64, TransportError> {
        let out = self
            .run_command(&format!("du -k {}", shell_quote(path)), None)
            .await?
            .into_result("du")?;
        let kib: u64 = out
            .stdout
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(kib * 1024)
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransportError> {
        let cmd = format!("rm -f {}", shell_quote(path));
        self.run_command(&cmd, None).await?.into_result(&cmd)?;
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<(), TransportError> {
        let cmd = format!("mkdir -p {}", shell_quote(path));
        self.run_command(&cmd, None).await?.into_result(&cmd)?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let cmd = format!("mv -f {} {}", shell_quote(from), shell_quote(to));
        self.run_command(&cmd, None).await?.into_result(&cmd)?;
        Ok(())
    }

    /// Create or resize `path` to `size` bytes without writing data.
    async fn preallocate(&self, path: &str, size: u64) -> Result<(), TransportError> {
        let q = shell_quote(path);
        let cmd = format!(
            "truncate -s {size} {q} 2>/dev/null || dd if=/dev/null of={q} bs=1 seek={size} 2>/dev/null"
        );
        self.run_command(&cmd, None).await?.into_result(&cmd)?;
        Ok(())
    }

    /// Stream `len` bytes of `path` starting at `offset` (to EOF when `len` is `None`).
    /// `offset` must be a multiple of [`BLOCK_SIZE`].
    async fn open_reader(
        &self,
        path: &str,
        offset: u64,
        len: Option<u64>,
    ) -> Result<ByteSource, TransportError> {
        let q = shell_quote(path);
        let command = match (offset, len) {
            (0, None) => format!("cat {q}"),
            (_, None) => format!("dd if={q} bs={BLOCK_SIZE} skip={} 2>/dev/null", offset / BLOCK_SIZE),
            (_, Some(len)) => format!(
                "dd if={q} bs={BLOCK_SIZE} skip={} 2>/dev/null | head -c {len}",
                offset / BLOCK_SIZE
            ),
        };
        let mut cmd = self.shell_command(&command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = spawn(cmd, &command)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::Unsupported("stdout capture"))?;
        Ok(ByteSource {
            child,
            stdout,
            command,
        })
    }

    /// Stream bytes into `path`. `None` replaces the whole file; `Some(offset)` writes in
    /// place from `offset`, which must be a multiple of [`BLOCK_SIZE`].
    async fn open_writer(
        &self,
        path: &str,
        offset: Option<u64>,
    ) -> Result<ByteSink, TransportError> {
        let q = shell_quote(path);
        let command = match offset {
            None => format!("cat > {q}"),
            Some(offset) => format!(
                "dd of={q} bs={BLOCK_SIZE} seek={} conv=notrunc 2>/dev/null",
                offset / BLOCK_SIZE
            ),
        };
        let mut cmd = self.shell_command(&command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = spawn(cmd, &command)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::Unsupported("stdin capture"))?;
        Ok(ByteSink {
            child,
            stdin,
            command,
        })
    }

    /// Whole-file copy with the host's high-throughput tool.
    async fn bulk_copy(
        &self,
        _direction: Direction,
        _local: &Path,
        _remote: &str,
        _progress: ByteProgress<'_>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("bulk copy"))
    }
}

/// Turns worker records and the origin definition into transports.
pub trait TransportFactory: Send + Sync {
    fn for_worker(&self, worker: &Worker) -> Result<Arc<dyn Transport>, TransportError>;

    /// The media origin, when it is reachable over SSH.
    fn origin(&self) -> Option<Arc<dyn Transport>>;

    fn local(&self) -> Arc<dyn Transport>;
}

/// Local workers run in-process shells, everything else goes over `ssh`.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    origin: Option<HostConfig>,
}

impl DefaultTransportFactory {
    pub fn new(origin: Option<HostConfig>) -> Self {
        Self { origin }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn for_worker(&self, worker: &Worker) -> Result<Arc<dyn Transport>, TransportError> {
        if worker.is_local {
            return Ok(Arc::new(LocalTransport));
        }
        let host = worker
            .host
            .clone()
            .ok_or_else(|| TransportError::NoHost(worker.id.clone()))?;
        Ok(Arc::new(SshTransport::new(host)))
    }

    fn origin(&self) -> Option<Arc<dyn Transport>> {
        self.origin
            .clone()
            .map(|host| Arc::new(SshTransport::new(host)) as Arc<dyn Transport>)
    }

    fn local(&self) -> Arc<dyn Transport> {
        Arc::new(LocalTransport)
    }
}
