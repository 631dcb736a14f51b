//! Timestamped container backups.
//!
//! A backup of `vault.kpt` is named
//! `vault.kpt.2026-01-31T09-15-02.123456Z.backup` and lives next to the
//! container or in the service's backup directory.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::file::{sync_parent, write_synced, VaultFileService};
use crate::format::{detect_version, unrecognized};
use lockbox_common::{Error, Result};

/// Suffix of every backup file.
pub const BACKUP_SUFFIX: &str = "backup";
/// Suffix of the container moved aside during a restore.
pub const OLD_SUFFIX: &str = "old";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6fZ";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.fZ";

/// One backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Full path of the backup.
    pub path: PathBuf,
    /// Timestamp parsed from the file name.
    pub created_at: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))
}

fn sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    Ok(path.with_file_name(format!("{}.{}", file_name(path)?, suffix)))
}

/// Parse the timestamp out of a backup name for `base`.
fn parse_backup_name(base: &str, candidate: &str) -> Option<DateTime<Utc>> {
    let stamp = candidate
        .strip_prefix(base)?
        .strip_prefix('.')?
        .strip_suffix(BACKUP_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_PARSE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl VaultFileService {
    fn backup_dir_for(&self, path: &Path) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Copy the current container to a new timestamped backup.
    ///
    /// # Errors
    /// - `NotFound` if `path` does not exist
    /// - Filesystem errors creating the backup
    pub async fn create_backup(&self, path: &Path) -> Result<PathBuf> {
        let base = file_name(path)?;
        let dir = self.backup_dir_for(path);
        if self.backup_dir.is_some() {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::from_io(e, format!("creating {}", dir.display())))?;
        }

        let bytes = fs::read(path)
            .await
            .map_err(|e| Error::from_io(e, format!("reading {}", path.display())))?;

        let mut stamp = Utc::now();
        let backup = loop {
            let candidate = dir.join(format!(
                "{}.{}.{}",
                base,
                stamp.format(TIMESTAMP_FORMAT),
                BACKUP_SUFFIX
            ));
            if !fs::try_exists(&candidate).await.unwrap_or(false) {
                break candidate;
            }
            stamp += Duration::microseconds(1);
        };

        write_synced(&backup, &bytes).await?;
        info!(backup = %backup.display(), "Backup created");
        Ok(backup)
    }

    /// Backups of `path`, newest first.
    ///
    /// Files that do not follow the backup naming scheme are ignored. A
    /// missing backup directory yields an empty list.
    pub async fn list_backups(&self, path: &Path) -> Result<Vec<BackupInfo>> {
        let base = file_name(path)?;
        let dir = self.backup_dir_for(path);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::from_io(e, format!("listing {}", dir.display()))),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(created_at) = name.to_str().and_then(|n| parse_backup_name(&base, n)) else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupInfo {
                path: entry.path(),
                created_at,
                size: meta.len(),
            });
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Delete all but the `keep` newest backups, returning how many went.
    pub async fn cleanup_old_backups(&self, path: &Path, keep: usize) -> Result<usize> {
        if keep == 0 {
            warn!("Backup cleanup with a limit of 0 ignored");
            return Ok(0);
        }

        let mut removed = 0;
        for backup in self.list_backups(path).await?.into_iter().skip(keep) {
            match fs::remove_file(&backup.path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(backup = %backup.path.display(), error = %e, "Failed to remove backup")
                }
            }
        }
        if removed > 0 {
            info!(removed, keep, "Old backups removed");
        }
        Ok(removed)
    }

    /// Replace the container with a backup (the newest by default).
    ///
    /// # Postconditions
    /// - On success `path` is byte-identical to the backup
    /// - On failure `path` holds its previous contents
    ///
    /// # Errors
    /// - `NotFound` if there is no backup
    /// - `Corrupted` if the backup is not a container
    /// - `Storage` if the restored copy does not verify
    pub async fn restore_from_backup(&self, path: &Path, backup: Option<&Path>) -> Result<PathBuf> {
        let backup = match backup {
            Some(b) => b.to_path_buf(),
            None => self
                .list_backups(path)
                .await?
                .into_iter()
                .next()
                .map(|b| b.path)
                .ok_or_else(|| Error::NotFound(format!("No backups for {}", path.display())))?,
        };
        if !fs::try_exists(&backup).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("Backup {} not found", backup.display())));
        }

        let old = sibling(path, OLD_SUFFIX)?;
        let moved_aside = match fs::rename(path, &old).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to move {} aside: {}",
                    path.display(),
                    e
                )))
            }
        };

        match self.copy_verified(&backup, path).await {
            Ok(()) => {
                if moved_aside {
                    if let Err(e) = fs::remove_file(&old).await {
                        warn!(
                            path = %old.display(),
                            error = %e,
                            "Failed to remove previous container"
                        );
                    }
                }
                sync_parent(path).await;
                info!(path = %path.display(), backup = %backup.display(), "Restored from backup");
                Ok(backup)
            }
            Err(err) => {
                let _ = fs::remove_file(path).await;
                if moved_aside {
                    fs::rename(&old, path).await.map_err(|e| {
                        Error::Storage(format!(
                            "Restore failed ({}), rollback failed: {}; old container at {}",
                            err,
                            e,
                            old.display()
                        ))
                    })?;
                }
                warn!(path = %path.display(), error = %err, "Restore rolled back");
                Err(err)
            }
        }
    }

    async fn copy_verified(&self, backup: &Path, path: &Path) -> Result<()> {
        let bytes = fs::read(backup)
            .await
            .map_err(|e| Error::from_io(e, format!("reading {}", backup.display())))?;
        if detect_version(&bytes).is_none() {
            return Err(unrecognized(&bytes));
        }

        self.stage(path, &bytes).await?.commit().await?;

        let written = fs::read(path)
            .await
            .map_err(|e| Error::from_io(e, format!("verifying {}", path.display())))?;
        if written != bytes {
            return Err(Error::Storage("Restored container does not match backup".to_string()));
        }
        debug!(size = bytes.len(), "Restored copy verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatVersion, V1Container};
    use tempfile::TempDir;

    fn container(fill: u8) -> Vec<u8> {
        V1Container {
            iterations: 100_000,
            body: vec![fill; 64],
        }
        .encode()
    }

    async fn write(service: &VaultFileService, path: &Path, fill: u8) {
        service
            .write(path, FormatVersion::V1, &container(fill))
            .await
            .unwrap();
    }

    #[test]
    fn test_backup_name_parsing() {
        let parsed = parse_backup_name("vault.kpt", "vault.kpt.2026-01-31T09-15-02.123456Z.backup");
        let expected =
            NaiveDateTime::parse_from_str("2026-01-31 09:15:02.123456", "%Y-%m-%d %H:%M:%S%.f")
                .unwrap()
                .and_utc();
        assert_eq!(parsed, Some(expected));

        assert_eq!(parse_backup_name("vault.kpt", "vault.kpt.tmp"), None);
        let foreign = "other.kpt.2026-01-31T09-15-02.123456Z.backup";
        assert_eq!(parse_backup_name("vault.kpt", foreign), None);
        assert_eq!(parse_backup_name("vault.kpt", "vault.kpt.yesterday.backup"), None);
    }

    #[tokio::test]
    async fn test_backups_are_distinct_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();

        for fill in 0..3u8 {
            write(&service, &path, fill).await;
            service.create_backup(&path).await.unwrap();
        }
        std::fs::write(dir.path().join("vault.kpt.notes.backup"), b"x").unwrap();

        let backups = service.list_backups(&path).await.unwrap();
        assert_eq!(backups.len(), 3);
        assert!(backups.windows(2).all(|w| w[0].created_at > w[1].created_at));
        assert_eq!(std::fs::read(&backups[0].path).unwrap(), container(2));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();

        for fill in 0..7u8 {
            write(&service, &path, fill).await;
            service.create_backup(&path).await.unwrap();
        }

        assert_eq!(service.cleanup_old_backups(&path, 5).await.unwrap(), 2);

        let remaining = service.list_backups(&path).await.unwrap();
        assert_eq!(remaining.len(), 5);
        for (backup, fill) in remaining.iter().zip((2..7u8).rev()) {
            assert_eq!(std::fs::read(&backup.path).unwrap(), container(fill));
        }
    }

    #[tokio::test]
    async fn test_cleanup_zero_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();
        write(&service, &path, 1).await;
        service.create_backup(&path).await.unwrap();

        assert_eq!(service.cleanup_old_backups(&path, 0).await.unwrap(), 0);
        assert_eq!(service.list_backups(&path).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_separate_backup_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let backups = dir.path().join("backups");
        let service = VaultFileService::with_backup_dir(&backups);

        assert!(service.list_backups(&path).await.unwrap().is_empty());
        write(&service, &path, 1).await;
        let backup = service.create_backup(&path).await.unwrap();

        assert_eq!(backup.parent(), Some(backups.as_path()));
        assert_eq!(service.list_backups(&path).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_latest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();

        write(&service, &path, 1).await;
        service.create_backup(&path).await.unwrap();
        write(&service, &path, 2).await;

        service.restore_from_backup(&path, None).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), container(1));
        assert!(!dir.path().join("vault.kpt.old").exists());
    }

    #[tokio::test]
    async fn test_restore_rolls_back_on_corrupt_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();
        write(&service, &path, 4).await;

        let bogus = dir.path().join("vault.kpt.2020-01-01T00-00-00.000000Z.backup");
        std::fs::write(&bogus, b"definitely not a container").unwrap();

        let err = service.restore_from_backup(&path, Some(&bogus)).await.unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
        assert_eq!(std::fs::read(&path).unwrap(), container(4));
        assert!(!dir.path().join("vault.kpt.old").exists());
    }

    #[tokio::test]
    async fn test_restore_without_backups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.kpt");
        let service = VaultFileService::new();
        write(&service, &path, 1).await;

        let err = service.restore_from_backup(&path, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
