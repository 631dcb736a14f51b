//! Atomic container file I/O.
//!
//! Every write goes to a sibling temp file that is synced and then renamed
//! over the target, so a reader sees either the old container or the new
//! one. A staged write that is dropped without being committed removes its
//! temp file and leaves the target untouched.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::format::{detect_version, unrecognized, FormatVersion};
use lockbox_common::{Error, Result};

/// Suffix of the temp file used while writing.
pub const TEMP_SUFFIX: &str = "tmp";

/// Owner read/write only.
#[cfg(unix)]
pub(crate) const FILE_MODE: u32 = 0o600;

/// Reads, writes and backs up container files.
#[derive(Debug, Clone, Default)]
pub struct VaultFileService {
    pub(crate) backup_dir: Option<PathBuf>,
}

impl VaultFileService {
    /// Service keeping backups next to the container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Service keeping backups in `dir`.
    pub fn with_backup_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: Some(dir.into()),
        }
    }

    /// Configured backup directory, if any.
    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    /// Read a container and identify its version.
    ///
    /// # Errors
    /// - `NotFound` / `PermissionDenied` from the filesystem
    /// - `Corrupted` or `UnsupportedVersion` if the magic is not recognized
    pub async fn read(&self, path: &Path) -> Result<(FormatVersion, Vec<u8>)> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| Error::from_io(e, format!("reading {}", path.display())))?;
        let version = detect_version(&bytes).ok_or_else(|| unrecognized(&bytes))?;
        debug!(path = %path.display(), ?version, size = bytes.len(), "Read container");
        Ok((version, bytes))
    }

    /// Atomically replace `path` with `bytes`.
    ///
    /// # Preconditions
    /// - `bytes` must be a complete container of `version`
    ///
    /// # Postconditions
    /// - `path` holds exactly `bytes` with mode 0600, or is unchanged
    ///
    /// # Errors
    /// - `InvalidInput` if the bytes are not a container of `version`
    /// - Filesystem errors; the temp file is removed on failure
    pub async fn write(&self, path: &Path, version: FormatVersion, bytes: &[u8]) -> Result<()> {
        match detect_version(bytes) {
            Some(detected) if detected == version => {}
            other => {
                return Err(Error::InvalidInput(format!(
                    "Refusing to write {:?} container as {:?}",
                    other, version
                )))
            }
        }

        self.stage(path, bytes).await?.commit().await?;
        info!(path = %path.display(), ?version, size = bytes.len(), "Container written");
        Ok(())
    }

    /// Write `bytes` to the temp sibling of `path` without touching `path`.
    ///
    /// The returned handle must be committed for the write to take effect.
    pub async fn stage(&self, path: &Path, bytes: &[u8]) -> Result<StagedWrite> {
        let staged = StagedWrite {
            temp: temp_path_for(path)?,
            target: path.to_path_buf(),
            committed: false,
        };
        // From here on, dropping `staged` on an error cleans up the temp file.
        write_synced(&staged.temp, bytes).await?;
        Ok(staged)
    }
}

/// A fully written temp file waiting to be renamed into place.
#[derive(Debug)]
pub struct StagedWrite {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    /// Location of the temp file.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Rename the temp file over the target and sync the directory.
    pub async fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp, &self.target).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to move {} into place: {}",
                self.target.display(),
                e
            ))
        })?;
        self.committed = true;
        sync_parent(&self.target).await;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.temp.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
    }
}

fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))?;
    let mut temp_name = name.to_os_string();
    temp_name.push(".");
    temp_name.push(TEMP_SUFFIX);
    Ok(path.with_file_name(temp_name))
}

/// Create (or truncate) `path` with mode 0600, write `bytes` and sync.
pub(crate) async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);

    let context = || format!("writing {}", path.display());
    let mut file = options
        .open(path)
        .await
        .map_err(|e| Error::from_io(e, context()))?;

    // The mode above only applies to newly created files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE))
            .await
            .map_err(|e| Error::from_io(e, context()))?;
    }

    file.write_all(bytes)
        .await
        .map_err(|e| Error::from_io(e, context()))?;
    file.flush().await.map_err(|e| Error::from_io(e, context()))?;
    file.sync_all()
        .await
        .map_err(|e| Error::from_io(e, context()))?;
    Ok(())
}

/// Best-effort fsync of the directory holding `path`.
pub(crate) async fn sync_parent(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    match fs::File::open(parent).await {
        Ok(dir) => {
            if let Err(e) = dir.sync_all().await {
                debug!(dir = %parent.display(), error = %e, "Directory sync skipped");
            }
        }
        Err(e) => debug!(dir = %parent.display(), error = %e, "Directory sync skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::V1Container;
    use tempfile::TempDir;

    fn v1_bytes(fill: u8) -> Vec<u8> {
        V1Container {
            iterations: 100_000,
            body: vec![fill; 80],
        }
        .encode()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();

        service.write(&path, FormatVersion::V1, &v1_bytes(1)).await.unwrap();
        let (version, bytes) = service.read(&path).await.unwrap();

        assert_eq!(version, FormatVersion::V1);
        assert_eq!(bytes, v1_bytes(1));
        assert!(!dir.path().join("vault.kpt.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        std::fs::write(&path, b"old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        VaultFileService::new()
            .write(&path, FormatVersion::V1, &v1_bytes(2))
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_write_refuses_mismatched_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();

        let err = service
            .write(&path, FormatVersion::V2, &v1_bytes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = service
            .write(&path, FormatVersion::V1, b"not a container")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_uncommitted_stage_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();
        service.write(&path, FormatVersion::V1, &v1_bytes(1)).await.unwrap();

        let staged = service.stage(&path, &v1_bytes(9)).await.unwrap();
        let temp = staged.temp_path().to_path_buf();
        assert!(temp.exists());
        drop(staged);

        assert!(!temp.exists());
        assert_eq!(std::fs::read(&path).unwrap(), v1_bytes(1));
    }

    #[tokio::test]
    async fn test_crash_before_rename_keeps_old_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();
        service.write(&path, FormatVersion::V1, &v1_bytes(1)).await.unwrap();

        // A process dying between sync and rename never runs destructors.
        let staged = service.stage(&path, &v1_bytes(9)).await.unwrap();
        std::mem::forget(staged);

        assert_eq!(std::fs::read(&path).unwrap(), v1_bytes(1));
        // The next successful write replaces the leftover temp file.
        service.write(&path, FormatVersion::V1, &v1_bytes(3)).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), v1_bytes(3));
        assert!(!dir.path().join("vault.kpt.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_missing_and_garbage() {
        let dir = TempDir::new().unwrap();
        let service = VaultFileService::new();

        let err = service.read(&dir.path().join("absent.kpt")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let garbage = dir.path().join("garbage.kpt");
        std::fs::write(&garbage, b"hello world, not a vault").unwrap();
        let err = service.read(&garbage).await.unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }
}
