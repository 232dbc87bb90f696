//! Live restore of the active SQLite database from a backup snapshot
//!
//! The restore never writes over the live file. It drains the pool as far as
//! it can, copies the snapshot into a fresh sibling file and then repoints
//! the persisted connection string at that file. The caller decides when to
//! reopen connections on the new path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, error, info, warn};

use crate::config::RestoreConfig;
use crate::database::config_store::{ConfigRepointer, ConfigStore};
use crate::database::drain::{ConnectionSource, DrainCoordinator};
use crate::database::{DATABASE_URL_KEY, DatabaseError, Result, lock, paths};

/// Phases of a restore, entered strictly in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Validating,
    Draining,
    Copying,
    Repointing,
    Done,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePhase::Validating => "validating",
            RestorePhase::Draining => "draining",
            RestorePhase::Copying => "copying",
            RestorePhase::Repointing => "repointing",
            RestorePhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of a backup or restore as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupResult {
    success: bool,
    message: String,
}

impl BackupResult {
    pub fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(true, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(false, message)
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BackupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "OK" } else { "FAILED" };
        write!(f, "[{}] {}", status, self.message)
    }
}

/// Validated inputs for one restore
struct RestorePlan {
    backup: PathBuf,
    active: PathBuf,
    target: PathBuf,
}

/// Replaces the in-use database with a backup snapshot
///
/// Only one restore may run against a database at a time; callers gate
/// entry with [`crate::database::gate::RestoreGate`].
pub struct RestoreExecutor {
    /// Database file used when the configuration names none
    default_database: PathBuf,
    /// Declared resource directory for the diagnostic file search
    resource_dir: PathBuf,
    drain: DrainCoordinator,
    repointer: ConfigRepointer,
}

impl RestoreExecutor {
    pub fn new(default_database: PathBuf, drain: DrainCoordinator, repointer: ConfigRepointer) -> Self {
        Self {
            default_database,
            resource_dir: PathBuf::from("resources"),
            drain,
            repointer,
        }
    }

    /// Build an executor from environment configuration over a pool collaborator
    pub fn from_config(config: &RestoreConfig, source: Arc<dyn ConnectionSource>) -> Self {
        let drain = DrainCoordinator::new(source).with_pause(config.drain_pause);
        let repointer = ConfigRepointer::new(
            ConfigStore::new(&config.config_file),
            config.secondary_config_file.as_ref().map(ConfigStore::new),
        );
        Self::new(config.database_path.clone(), drain, repointer)
            .with_resource_dir(config.resource_dir.clone())
    }

    /// Set the resource directory probed when the active file is missing
    pub fn with_resource_dir(mut self, resource_dir: PathBuf) -> Self {
        self.resource_dir = resource_dir;
        self
    }

    pub fn drain_coordinator(&self) -> &DrainCoordinator {
        &self.drain
    }

    /// Database file the application should currently be using
    pub async fn active_database_path(&self) -> Result<PathBuf> {
        let configured = self
            .repointer
            .active_database()
            .await
            .unwrap_or_else(|| self.default_database.clone());
        paths::normalize_path(&configured.to_string_lossy())
    }

    /// Restore the database from the snapshot at `backup_path`.
    ///
    /// Never fails: every error is reported through the returned result.
    pub async fn restore_database(&self, backup_path: &str) -> BackupResult {
        let started = Instant::now();
        info!(backup = %backup_path.trim(), "restore requested");

        self.enter(RestorePhase::Validating);
        let plan = match self.validate(backup_path).await {
            Ok(plan) => plan,
            Err(e) => return self.fail(RestorePhase::Validating, e),
        };

        self.enter(RestorePhase::Draining);
        let report = self.drain.drain().await;
        debug!(?report, "drain report");

        self.enter(RestorePhase::Copying);
        let bytes = match self.copy(&plan).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(RestorePhase::Copying, e),
        };
        info!(restore_target = %plan.target.display(), bytes, "backup copied");

        self.enter(RestorePhase::Repointing);
        match self.repointer.repoint(&plan.target).await {
            Ok(_) => {
                self.enter(RestorePhase::Done);
                info!(
                    restore_target = %plan.target.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "restore completed"
                );
                BackupResult::success(format!(
                    "Database restored from {} into {}. New connections will use the restored file.",
                    plan.backup.display(),
                    plan.target.display()
                ))
            }
            Err(e) => {
                // The copied file stays on disk so it can be repointed by hand
                error!(restore_target = %plan.target.display(), error = %e, "restore copied but not repointed");
                BackupResult::failure(format!(
                    "Backup was copied to {} but the configuration was not updated: {}. \
                     Set {} to this file manually to finish the restore.",
                    plan.target.display(),
                    e,
                    DATABASE_URL_KEY
                ))
            }
        }
    }

    fn enter(&self, phase: RestorePhase) {
        info!(%phase, "restore phase");
    }

    fn fail(&self, phase: RestorePhase, error: DatabaseError) -> BackupResult {
        error!(%phase, error = %error, "restore failed");
        BackupResult::failure(format!("Restore failed while {}: {}", phase, error))
    }

    async fn validate(&self, backup_path: &str) -> Result<RestorePlan> {
        let backup = paths::normalize_path(backup_path)?;
        match tokio_fs::metadata(&backup).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Err(DatabaseError::BackupNotFound(backup)),
        }

        let active = self.active_database_path().await?;
        self.log_active_state(&active).await;

        let target = paths::restore_target_for(&active);
        if same_file(&backup, &target).await {
            return Err(DatabaseError::InvalidPath(format!(
                "{} is the restore target itself; copy it elsewhere first",
                backup.display()
            )));
        }

        Ok(RestorePlan { backup, active, target })
    }

    // Diagnostics only; neither outcome blocks the restore
    async fn log_active_state(&self, active: &Path) {
        let lock_path = active.to_path_buf();
        let state = match tokio::task::spawn_blocking(move || lock::probe(&lock_path)).await {
            Ok(state) => state,
            Err(e) => {
                warn!(active = %active.display(), error = %e, "lock check did not complete");
                return;
            }
        };

        if state.locked {
            warn!(active = %active.display(), "active database is locked, restoring into a new file");
        } else if !state.exists {
            let name = active.file_name().map(|name| name.to_string_lossy().into_owned());
            let candidates = paths::fallback_candidates(&self.resource_dir);
            let search = tokio::task::spawn_blocking(move || {
                name.and_then(|name| paths::find_in_candidates(&name, &candidates))
            });
            let hit = search.await.unwrap_or_else(|e| {
                warn!(error = %e, "fallback search did not complete");
                None
            });
            match hit {
                Some(found) => warn!(
                    active = %active.display(),
                    found = %found.display(),
                    "active database is missing but a file with the same name exists elsewhere"
                ),
                None => warn!(active = %active.display(), "active database is missing"),
            }
        } else {
            debug!(active = %active.display(), "active database is not locked");
        }
    }

    async fn copy(&self, plan: &RestorePlan) -> Result<u64> {
        let copy_error = |error: std::io::Error| DatabaseError::Copy {
            backup: plan.backup.clone(),
            target: plan.target.clone(),
            error,
        };

        if let Some(parent) = plan.target.parent() {
            tokio_fs::create_dir_all(parent).await.map_err(copy_error)?;
        }
        debug!(active = %plan.active.display(), restore_target = %plan.target.display(), "copying backup");

        // A stale target from an earlier restore is overwritten
        let bytes = tokio_fs::copy(&plan.backup, &plan.target)
            .await
            .map_err(copy_error)?;

        let file = tokio_fs::File::open(&plan.target).await.map_err(copy_error)?;
        file.sync_all().await.map_err(copy_error)?;
        Ok(bytes)
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio_fs::canonicalize(a).await, tokio_fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::drain::MockConnectionSource;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        active: PathBuf,
        config: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let data = dir.path().join("data");
            std::fs::create_dir_all(&data).unwrap();
            let active = data.join("app.db");
            std::fs::write(&active, b"live database").unwrap();

            let config = dir.path().join("app.env");
            std::fs::write(
                &config,
                format!("APP_NAME=events\nDATABASE_URL=sqlite:{}\n", active.display()),
            )
            .unwrap();

            Self { dir, active, config }
        }

        fn backup(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn executor(&self) -> RestoreExecutor {
            self.executor_with_config(self.config.clone())
        }

        fn executor_with_config(&self, config: PathBuf) -> RestoreExecutor {
            let mut source = MockConnectionSource::new();
            source.expect_get_connection().returning(|| None);
            source.expect_reclaim_idle().returning(|| 0);

            let drain = DrainCoordinator::new(Arc::new(source)).with_pause(Duration::ZERO);
            let repointer = ConfigRepointer::new(ConfigStore::new(config), None);
            RestoreExecutor::new(self.active.clone(), drain, repointer)
                .with_resource_dir(self.dir.path().join("resources"))
        }
    }

    #[tokio::test]
    async fn test_restore_copies_and_repoints() {
        let fixture = Fixture::new();
        let content: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
        let backup = fixture.backup("snap.db", &content);

        let result = fixture.executor().restore_database(&backup.to_string_lossy()).await;

        let target = fixture.active.with_file_name("app-new.db");
        assert!(result.is_success(), "{}", result);
        assert!(result.message().contains(&target.display().to_string()));
        assert_eq!(std::fs::read(&target).unwrap(), content);
        assert_eq!(std::fs::read(&fixture.active).unwrap(), b"live database");

        let store = ConfigStore::new(&fixture.config);
        assert_eq!(
            store.get(DATABASE_URL_KEY).await.unwrap(),
            Some(format!("sqlite:{}", target.display()))
        );
        assert_eq!(store.get("APP_NAME").await.unwrap(), Some("events".to_string()));
    }

    #[tokio::test]
    async fn test_restore_keeps_other_config_lines_intact() {
        let fixture = Fixture::new();
        let original = format!(
            "# settings\nLOG_DIR=${{HOME}}/logs\nSECRET=pa$$word\nWIN=C:\\data\\app\nDATABASE_URL=sqlite:{}\n",
            fixture.active.display()
        );
        std::fs::write(&fixture.config, &original).unwrap();
        let backup = fixture.backup("snap.db", b"snapshot bytes");

        let result = fixture.executor().restore_database(&backup.to_string_lossy()).await;

        assert!(result.is_success(), "{}", result);
        let target = fixture.active.with_file_name("app-new.db");
        let expected = original.replace(
            &format!("DATABASE_URL=sqlite:{}", fixture.active.display()),
            &format!("DATABASE_URL=sqlite:{}", target.display()),
        );
        assert_eq!(std::fs::read_to_string(&fixture.config).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_whitespace_path_is_rejected_without_writes() {
        let fixture = Fixture::new();
        let before = std::fs::read(&fixture.config).unwrap();

        let result = fixture.executor().restore_database("   ").await;

        assert!(!result.is_success());
        assert!(result.message().contains("Invalid path"), "{}", result);
        assert_eq!(std::fs::read(&fixture.config).unwrap(), before);
        assert!(!fixture.active.with_file_name("app-new.db").exists());
    }

    #[tokio::test]
    async fn test_missing_backup_leaves_config_untouched() {
        let fixture = Fixture::new();
        let before = std::fs::read(&fixture.config).unwrap();
        let missing = fixture.dir.path().join("missing.db");

        let result = fixture.executor().restore_database(&missing.to_string_lossy()).await;

        assert!(!result.is_success());
        assert!(result.message().contains(&missing.display().to_string()));
        assert_eq!(std::fs::read(&fixture.config).unwrap(), before);
        assert!(!fixture.active.with_file_name("app-new.db").exists());
    }

    #[tokio::test]
    async fn test_directory_backup_is_rejected() {
        let fixture = Fixture::new();
        let before = std::fs::read(&fixture.config).unwrap();
        let directory = fixture.dir.path().join("snapshots");
        std::fs::create_dir_all(&directory).unwrap();

        let result = fixture.executor().restore_database(&directory.to_string_lossy()).await;

        assert!(!result.is_success());
        assert!(result.message().contains("not a regular file"));
        assert_eq!(std::fs::read(&fixture.config).unwrap(), before);
    }

    #[tokio::test]
    async fn test_config_failure_is_partial_success() {
        let fixture = Fixture::new();
        let backup = fixture.backup("snap.db", b"snapshot bytes");
        let executor = fixture.executor_with_config(fixture.dir.path().join("absent.env"));

        let result = executor.restore_database(&backup.to_string_lossy()).await;

        let target = fixture.active.with_file_name("app-new.db");
        assert!(!result.is_success());
        assert!(result.message().contains(&target.display().to_string()), "{}", result);
        assert_eq!(std::fs::read(&target).unwrap(), b"snapshot bytes");
    }

    #[tokio::test]
    async fn test_stale_target_is_overwritten() {
        let fixture = Fixture::new();
        let target = fixture.active.with_file_name("app-new.db");
        std::fs::write(&target, b"stale leftovers from an older restore").unwrap();
        let backup = fixture.backup("snap.db", b"fresh");

        let result = fixture.executor().restore_database(&backup.to_string_lossy()).await;

        assert!(result.is_success(), "{}", result);
        assert_eq!(std::fs::read(&target).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_fixed_target_is_overwritten_when_not_repointed() {
        let fixture = Fixture::new();
        let first = fixture.backup("first.db", b"first snapshot");
        let second = fixture.backup("second.db", b"second snapshot");
        // Without a writable config the active file never changes
        let executor = fixture.executor_with_config(fixture.dir.path().join("absent.env"));
        let target = fixture.active.with_file_name("app-new.db");

        executor.restore_database(&first.to_string_lossy()).await;
        assert_eq!(std::fs::read(&target).unwrap(), b"first snapshot");

        executor.restore_database(&second.to_string_lossy()).await;
        assert_eq!(std::fs::read(&target).unwrap(), b"second snapshot");
    }

    #[tokio::test]
    async fn test_sequential_restores_use_distinct_targets() {
        let fixture = Fixture::new();
        let first = fixture.backup("first.db", b"first snapshot");
        let second = fixture.backup("second.db", b"second snapshot");
        let executor = fixture.executor();

        assert!(executor.restore_database(&first.to_string_lossy()).await.is_success());
        let first_target = executor.active_database_path().await.unwrap();

        assert!(executor.restore_database(&second.to_string_lossy()).await.is_success());
        let second_target = executor.active_database_path().await.unwrap();

        assert_ne!(first_target, second_target);
        assert_eq!(std::fs::read(&first_target).unwrap(), b"first snapshot");
        assert_eq!(std::fs::read(&second_target).unwrap(), b"second snapshot");
    }

    #[tokio::test]
    async fn test_restoring_from_target_itself_is_rejected() {
        let fixture = Fixture::new();
        let target = fixture.active.with_file_name("app-new.db");
        std::fs::write(&target, b"keep me").unwrap();
        let before = std::fs::read(&fixture.config).unwrap();

        let result = fixture.executor().restore_database(&target.to_string_lossy()).await;

        assert!(!result.is_success());
        assert_eq!(std::fs::read(&target).unwrap(), b"keep me");
        assert_eq!(std::fs::read(&fixture.config).unwrap(), before);
    }

    #[tokio::test]
    async fn test_drain_without_connection_still_copies() {
        let fixture = Fixture::new();
        let backup = fixture.backup("snap.db", b"copied anyway");

        let mut source = MockConnectionSource::new();
        source.expect_get_connection().times(1).returning(|| None);
        source.expect_reclaim_idle().times(1).returning(|| 0);
        let drain = DrainCoordinator::new(Arc::new(source)).with_pause(Duration::ZERO);
        let repointer = ConfigRepointer::new(ConfigStore::new(&fixture.config), None);
        let executor = RestoreExecutor::new(fixture.active.clone(), drain, repointer);

        let result = executor.restore_database(&backup.to_string_lossy()).await;

        assert!(result.is_success(), "{}", result);
        assert_eq!(
            std::fs::read(fixture.active.with_file_name("app-new.db")).unwrap(),
            b"copied anyway"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_failure_leaves_config_untouched() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new();
        let backup = fixture.backup("snap.db", b"unreadable");
        std::fs::set_permissions(&backup, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::File::open(&backup).is_ok() {
            // Running as root, permissions are not enforced
            return;
        }
        let before = std::fs::read(&fixture.config).unwrap();

        let result = fixture.executor().restore_database(&backup.to_string_lossy()).await;

        assert!(!result.is_success());
        assert!(result.message().contains("copying"), "{}", result);
        assert_eq!(std::fs::read(&fixture.config).unwrap(), before);
    }

    #[test]
    fn test_backup_result_display() {
        assert_eq!(BackupResult::success("done").to_string(), "[OK] done");
        assert_eq!(BackupResult::failure("nope").to_string(), "[FAILED] nope");
        assert!(BackupResult::new(true, "x").is_success());
    }
}
