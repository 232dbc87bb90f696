//! SQLite snapshot creation
//!
//! Snapshots are written with `VACUUM INTO`, which produces a consistent,
//! compacted copy of the live database without blocking readers. The files
//! land in the local backup directory and are what a restore consumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::database::drain::SqlitePoolSource;
use crate::database::restore::BackupResult;
use crate::database::{DatabaseError, Result};

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_EXTENSION: &str = ".db";

/// File name for a snapshot taken at `timestamp`
pub fn backup_file_name(timestamp: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        BACKUP_PREFIX,
        timestamp.format("%Y-%m-%d_%H%M%S"),
        BACKUP_EXTENSION
    )
}

/// Manager for SQLite snapshot operations
pub struct BackupManager {
    /// Shared pool of the live database
    source: Arc<SqlitePoolSource>,
    /// Directory receiving snapshot files
    backup_dir: PathBuf,
    /// Mutex to ensure only one backup runs at a time
    backup_mutex: Mutex<()>,
}

impl BackupManager {
    /// Create a new backup manager
    pub fn new(source: Arc<SqlitePoolSource>, backup_dir: PathBuf) -> Self {
        Self {
            source,
            backup_dir,
            backup_mutex: Mutex::new(()),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Write a snapshot of the live database into the backup directory
    pub async fn create_backup(&self) -> BackupResult {
        match self.create_backup_at(Utc::now()).await {
            Ok(path) => BackupResult::success(format!("Backup written to {}", path.display())),
            Err(e) => {
                error!(error = %e, "backup failed");
                BackupResult::failure(format!("Backup failed: {}", e))
            }
        }
    }

    /// Write a snapshot named after `timestamp` and return its path
    pub async fn create_backup_at(&self, timestamp: DateTime<Utc>) -> Result<PathBuf> {
        // Acquire mutex to ensure only one backup runs at a time
        let _lock = self.backup_mutex.lock().await;
        let start_time = Instant::now();

        tokio_fs::create_dir_all(&self.backup_dir).await?;
        let backup_path = self.backup_dir.join(backup_file_name(timestamp));
        if tokio_fs::try_exists(&backup_path).await? {
            return Err(DatabaseError::Config(format!(
                "{} already exists",
                backup_path.display()
            )));
        }

        let dest_path = backup_path
            .to_str()
            .ok_or_else(|| DatabaseError::InvalidPath(backup_path.display().to_string()))?;

        // VACUUM INTO cannot run inside a transaction, so it goes straight to the pool
        let vacuum_sql = format!("VACUUM INTO '{}'", dest_path.replace('\'', "''"));
        sqlx::query(&vacuum_sql)
            .execute(&self.source.pool())
            .await
            .map_err(|e| DatabaseError::Sqlite(format!("Failed to execute VACUUM INTO: {}", e)))?;

        let size_bytes = tokio_fs::metadata(&backup_path).await?.len();
        info!(
            path = %backup_path.display(),
            size_bytes,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "backup created"
        );
        Ok(backup_path)
    }

    /// List snapshot files, newest first
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        if !tokio_fs::try_exists(&self.backup_dir).await? {
            return Ok(Vec::new());
        }

        let mut entries = tokio_fs::read_dir(&self.backup_dir).await?;
        let mut backups = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_backup = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_EXTENSION))
                .unwrap_or(false);

            if is_backup && entry.file_type().await?.is_file() {
                backups.push(path);
            }
        }

        // Names embed the timestamp, so reverse lexical order is newest first
        backups.sort_by(|a, b| b.cmp(a));
        Ok(backups)
    }
}
