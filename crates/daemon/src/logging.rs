//! Logging init: `fleetcode.log` in the state directory, or stderr when that fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,fleetcode=debug";
pub const LOG_FILE_NAME: &str = "fleetcode.log";

/// A file handle, or stderr when the handle cannot be cloned.
enum FileOrStderr {
    File(fs::File),
    Stderr,
}

impl io::Write for FileOrStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileOrStderr::File(f) => f.write(buf),
            FileOrStderr::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileOrStderr::File(f) => f.flush(),
            FileOrStderr::Stderr => io::stderr().lock().flush(),
        }
    }
}

struct FileMakeWriter(fs::File);

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileOrStderr;

    fn make_writer(&'a self) -> Self::Writer {
        self.0
            .try_clone()
            .map(FileOrStderr::File)
            .unwrap_or(FileOrStderr::Stderr)
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Open (append) the log file under `state_dir`, creating the directory.
pub fn open_log_file(state_dir: &Path) -> io::Result<(fs::File, PathBuf)> {
    fs::create_dir_all(state_dir)?;
    let path = state_dir.join(LOG_FILE_NAME);
    let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Log to `{state_dir}/fleetcode.log`. `RUST_LOG` overrides the default filter.
///
/// Returns an error when the file cannot be opened so the caller can use
/// [`init_logging_stderr`] instead.
pub fn init_logging(state_dir: &Path) -> io::Result<()> {
    let (file, path) = open_log_file(state_dir)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(BoxMakeWriter::new(FileMakeWriter(file)))
        .with_ansi(false)
        .init();
    tracing::info!("fleetcode logging initialized at {}", path.display());
    Ok(())
}

pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_is_appended() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");

        let (mut first, path) = open_log_file(&state).unwrap();
        writeln!(first, "one").unwrap();
        let (mut second, _) = open_log_file(&state).unwrap();
        writeln!(second, "two").unwrap();

        assert_eq!(path, state.join(LOG_FILE_NAME));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_writer_clones_file_handle() {
        let dir = TempDir::new().unwrap();
        let (file, path) = open_log_file(dir.path()).unwrap();
        let make = FileMakeWriter(file);
        let mut writer = make.make_writer();
        writer.write_all(b"line\n").unwrap();
        writer.flush().unwrap();
        assert!(matches!(writer, FileOrStderr::File(_)));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "line\n");
    }
}
