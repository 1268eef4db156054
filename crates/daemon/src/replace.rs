//! In-place replacement of originals with their encoded versions.
//!
//! The original is renamed to `<original>.original`, the output is moved into its place and
//! the backup is deleted only after both moves succeeded. Any failure puts the original back.
//! Once both moves succeeded the replacement stands; a backup that cannot be deleted is only
//! logged.

use crate::transport::{Transport, TransportError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to move the original out of the way.
    #[error("Failed to create backup: {reason}")]
    BackupFailed { reason: String, output: Vec<String> },

    /// Failed to move the encoded file into place. The original was restored.
    #[error("Failed to move encoded file into place: {reason}")]
    MoveFailed { reason: String, output: Vec<String> },

    /// The swap failed and the backup could not be put back either.
    #[error("Failed to restore original from {backup}: {reason}")]
    RestoreFailed { backup: String, reason: String },
}

impl ReplaceError {
    /// Output of the command behind the failure, for remote replacements.
    pub fn output_lines(&self) -> Vec<String> {
        match self {
            ReplaceError::BackupFailed { output, .. } | ReplaceError::MoveFailed { output, .. } => {
                output.clone()
            }
            ReplaceError::RestoreFailed { .. } => Vec::new(),
        }
    }
}

/// Backup location for an original: `<original>.original`.
pub fn backup_path(original: &Path) -> PathBuf {
    let mut backup = original.as_os_str().to_owned();
    backup.push(".original");
    PathBuf::from(backup)
}

/// Where the encoded file ends up: the original's path, with the extension switched when the
/// container changed.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use fleetcode::replace::final_path;
///
/// assert_eq!(final_path(Path::new("/m/Film.avi"), "mkv"), Path::new("/m/Film.mkv"));
/// assert_eq!(final_path(Path::new("/m/Film.mkv"), "mkv"), Path::new("/m/Film.mkv"));
/// ```
pub fn final_path(original: &Path, container: &str) -> PathBuf {
    let same = original
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(container))
        .unwrap_or(false);
    if same || container.is_empty() {
        original.to_path_buf()
    } else {
        original.with_extension(container)
    }
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    // rename fails across filesystems, e.g. staging dir to media share
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Replace a file on the local filesystem. Returns the final path of the encoded file.
///
/// # Arguments
///
/// * `original_path` - Path to the original video file
/// * `encoded_path` - Path to the encoded video file
/// * `container` - Container of the encoded file, used for the final extension
pub async fn replace_local(
    original_path: &Path,
    encoded_path: &Path,
    container: &str,
) -> Result<PathBuf, ReplaceError> {
    let backup = backup_path(original_path);
    let target = final_path(original_path, container);

    tokio::fs::rename(original_path, &backup)
        .await
        .map_err(|e| ReplaceError::BackupFailed {
            reason: e.to_string(),
            output: Vec::new(),
        })?;

    if let Err(e) = move_file(encoded_path, &target).await {
        warn!(original = %original_path.display(), error = %e, "swap failed, restoring original");
        return match tokio::fs::rename(&backup, original_path).await {
            Ok(()) => Err(ReplaceError::MoveFailed {
                reason: e.to_string(),
                output: Vec::new(),
            }),
            Err(restore) => Err(ReplaceError::RestoreFailed {
                backup: backup.display().to_string(),
                reason: restore.to_string(),
            }),
        };
    }

    if let Err(e) = tokio::fs::remove_file(&backup).await {
        warn!(backup = %backup.display(), error = %e, "could not delete backup, leaving it in place");
    }

    info!(original = %original_path.display(), replaced = %target.display(), "replaced original");
    Ok(target)
}

/// Replace a file on a transport's host with shell renames. Returns the final path.
pub async fn replace_remote(
    host: &dyn Transport,
    original_path: &str,
    encoded_path: &str,
    container: &str,
) -> Result<String, ReplaceError> {
    let original = Path::new(original_path);
    let backup = backup_path(original).to_string_lossy().into_owned();
    let target = final_path(original, container)
        .to_string_lossy()
        .into_owned();

    host.rename(original_path, &backup)
        .await
        .map_err(|e| ReplaceError::BackupFailed {
            reason: e.to_string(),
            output: e.output_lines(),
        })?;

    if let Err(e) = host.rename(encoded_path, &target).await {
        warn!(host = %host.describe(), original = original_path, error = %e, "remote swap failed, restoring original");
        return match host.rename(&backup, original_path).await {
            Ok(()) => Err(ReplaceError::MoveFailed {
                reason: e.to_string(),
                output: e.output_lines(),
            }),
            Err(restore) => Err(ReplaceError::RestoreFailed {
                backup,
                reason: restore.to_string(),
            }),
        };
    }

    if let Err(e) = host.remove_file(&backup).await {
        warn!(host = %host.describe(), backup = %backup, error = %e, "could not delete backup, leaving it in place");
    }

    info!(host = %host.describe(), original = original_path, replaced = %target, "replaced original");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backup_path_format() {
        let backup = backup_path(Path::new("/media/movies/film.mkv"));
        assert_eq!(backup, PathBuf::from("/media/movies/film.mkv.original"));
    }

    #[test]
    fn test_final_path_follows_container() {
        assert_eq!(
            final_path(Path::new("/m/Film.MKV"), "mkv"),
            PathBuf::from("/m/Film.MKV")
        );
        assert_eq!(
            final_path(Path::new("/m/Film.mp4"), "mkv"),
            PathBuf::from("/m/Film.mkv")
        );
    }

    #[tokio::test]
    async fn test_replace_local_swaps_and_drops_backup() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("film.mkv");
        let encoded = dir.path().join("film.fleetcode.mkv");
        std::fs::write(&original, b"original content").unwrap();
        std::fs::write(&encoded, b"encoded").unwrap();

        let target = replace_local(&original, &encoded, "mkv").await.unwrap();

        assert_eq!(target, original);
        assert_eq!(std::fs::read(&original).unwrap(), b"encoded");
        assert!(!encoded.exists());
        assert!(!backup_path(&original).exists());
    }

    #[tokio::test]
    async fn test_replace_local_changes_extension() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("film.avi");
        let encoded = dir.path().join("film.fleetcode.mkv");
        std::fs::write(&original, b"old").unwrap();
        std::fs::write(&encoded, b"new").unwrap();

        let target = replace_local(&original, &encoded, "mkv").await.unwrap();

        assert_eq!(target, dir.path().join("film.mkv"));
        assert!(!original.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_replace_local_restores_original_on_failure() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("film.mkv");
        std::fs::write(&original, b"original content").unwrap();
        let missing = dir.path().join("nope.mkv");

        let err = replace_local(&original, &missing, "mkv").await.unwrap_err();

        assert!(matches!(err, ReplaceError::MoveFailed { .. }));
        assert_eq!(std::fs::read(&original).unwrap(), b"original content");
        assert!(!backup_path(&original).exists());
    }

    #[tokio::test]
    async fn test_replace_local_missing_original_is_backup_failure() {
        let dir = TempDir::new().unwrap();
        let encoded = dir.path().join("film.fleetcode.mkv");
        std::fs::write(&encoded, b"encoded").unwrap();

        let err = replace_local(&dir.path().join("film.mkv"), &encoded, "mkv")
            .await
            .unwrap_err();

        assert!(matches!(err, ReplaceError::BackupFailed { .. }));
        assert!(encoded.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replace_remote_through_shell() {
        use crate::transport::LocalTransport;
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("show.mp4");
        let encoded = dir.path().join("show.fleetcode.mkv");
        std::fs::write(&original, b"old").unwrap();
        std::fs::write(&encoded, b"new").unwrap();

        let target = replace_remote(
            &LocalTransport,
            original.to_str().unwrap(),
            encoded.to_str().unwrap(),
            "mkv",
        )
        .await
        .unwrap();

        assert_eq!(target, dir.path().join("show.mkv").to_str().unwrap());
        assert_eq!(std::fs::read(dir.path().join("show.mkv")).unwrap(), b"new");
        assert!(!original.exists());
        assert!(!dir.path().join("show.mp4.original").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replace_remote_restores_on_failure() {
        use crate::transport::LocalTransport;
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("show.mkv");
        std::fs::write(&original, b"old").unwrap();

        let err = replace_remote(
            &LocalTransport,
            original.to_str().unwrap(),
            dir.path().join("missing.mkv").to_str().unwrap(),
            "mkv",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ReplaceError::MoveFailed { .. }));
        assert_eq!(std::fs::read(&original).unwrap(), b"old");
    }

    /// Renames work, deleting files does not.
    #[cfg(unix)]
    struct KeepsFiles;

    #[cfg(unix)]
    #[async_trait::async_trait]
    impl Transport for KeepsFiles {
        fn describe(&self) -> String {
            "keeps-files".to_string()
        }

        fn shell_command(&self, command: &str) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }

        async fn remove_file(&self, _path: &str) -> Result<(), TransportError> {
            Err(TransportError::Unsupported("rm"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_undeletable_backup_still_counts_as_replaced() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("show.mkv");
        let encoded = dir.path().join("show.fleetcode.mkv");
        std::fs::write(&original, b"old").unwrap();
        std::fs::write(&encoded, b"new").unwrap();

        let target = replace_remote(
            &KeepsFiles,
            original.to_str().unwrap(),
            encoded.to_str().unwrap(),
            "mkv",
        )
        .await
        .unwrap();

        assert_eq!(target, original.to_str().unwrap());
        assert_eq!(std::fs::read(&original).unwrap(), b"new");
        assert_eq!(std::fs::read(backup_path(&original)).unwrap(), b"old");
    }
}
