use super::{shell_quote, ByteProgress, Direction, LineSplitter, Transport, TransportError};
use crate::config::HostConfig;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// A host reached through the system `ssh` client. Requires key-based auth.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: HostConfig,
}

impl SshTransport {
    pub fn new(host: HostConfig) -> Self {
        Self { host }
    }

    fn destination(&self) -> String {
        match &self.host.username {
            Some(user) => format!("{}@{}", user, self.host.hostname),
            None => self.host.hostname.clone(),
        }
    }

    /// Options shared by ssh and rsync's remote shell.
    fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=15".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-p".to_string(),
            self.host.port.to_string(),
        ];
        if let Some(key) = &self.host.key_path {
            opts.push("-i".to_string());
            opts.push(key.to_string_lossy().into_owned());
        }
        opts
    }
}

/// Bytes transferred from an rsync `--progress` line such as
/// `  1,234,567  45%   10.50MB/s    0:00:12`.
pub(crate) fn parse_rsync_progress(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    let bytes = tokens.next()?;
    let percent = tokens.next()?;
    if !percent.ends_with('%') {
        return None;
    }
    bytes.replace(',', "").parse().ok()
}

#[async_trait]
impl Transport for SshTransport {
    fn describe(&self) -> String {
        format!("{}:{}", self.destination(), self.host.port)
    }

    fn shell_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options())
            .arg(self.destination())
            .arg("--")
            .arg(command);
        cmd
    }

    async fn bulk_copy(
        &self,
        direction: Direction,
        local: &Path,
        remote: &str,
        progress: ByteProgress<'_>,
    ) -> Result<(), TransportError> {
        let remote_shell = std::iter::once("ssh".to_string())
            .chain(self.ssh_options())
            .map(|opt| shell_quote(&opt))
            .collect::<Vec<_>>()
            .join(" ");
        let remote_spec = format!("{}:{}", self.destination(), remote);
        let local_spec = local.to_string_lossy().into_owned();
        let (src, dst) = match direction {
            Direction::Upload => (local_spec, remote_spec),
            Direction::Download => (remote_spec, local_spec),
        };

        let mut cmd = Command::new("rsync");
        cmd.args(["--partial", "--inplace", "--progress", "--protect-args", "-e"])
            .arg(&remote_shell)
            .arg(&src)
            .arg(&dst)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            program: "rsync".to_string(),
            source: e,
        })?;

        if let Some(mut stdout) = child.stdout.take() {
            let mut splitter = LineSplitter::default();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                splitter.push(&buf[..n], |line| {
                    if let Some(bytes) = parse_rsync_progress(line) {
                        progress(bytes);
                    }
                });
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::CommandFailed {
                command: format!("rsync {} {}", src, dst),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn host() -> HostConfig {
        HostConfig {
            hostname: "gpu-1.lan".into(),
            port: 2222,
            username: Some("encoder".into()),
            key_path: Some(PathBuf::from("/keys/id_ed25519")),
        }
    }

    #[test]
    fn test_shell_command_targets_host() {
        let transport = SshTransport::new(host());
        let cmd = transport.shell_command("echo ok");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        let dest = args.iter().position(|a| a == "encoder@gpu-1.lan").unwrap();
        assert_eq!(args[dest + 1], "--");
        assert_eq!(args[dest + 2], "echo ok");
        assert_eq!(transport.describe(), "encoder@gpu-1.lan:2222");
    }

    #[test]
    fn test_parse_rsync_progress() {
        assert_eq!(
            parse_rsync_progress("  1,234,567  45%   10.50MB/s    0:00:12"),
            Some(1_234_567)
        );
        assert_eq!(
            parse_rsync_progress("104,857,600 100%  110.21MB/s    0:00:00 (xfr#1, to-chk=0/1)"),
            Some(104_857_600)
        );
        assert_eq!(parse_rsync_progress("sending incremental file list"), None);
        assert_eq!(parse_rsync_progress("movie.mkv"), None);
    }
}
