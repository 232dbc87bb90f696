//! Best-effort release of database file handles held by the connection pool
//!
//! A pool cannot be forced to let go of its file handles synchronously, so
//! draining is modelled as a bounded sequence of independent steps whose
//! failures are logged and swallowed. Restores never depend on a drain
//! succeeding; they copy into a fresh file instead of the live one.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::{Connection, Executor, Sqlite, SqliteConnection, pool::PoolConnection};
use sqlx::sqlite::SqliteConnectOptions;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::database::{DatabaseError, Result};
use crate::db::DbPool;

/// Merge the write-ahead log into the main database file
pub const CHECKPOINT_COMMAND: &str = "PRAGMA wal_checkpoint(TRUNCATE)";

/// Let SQLite run its maintenance pass before the connection goes away
pub const OPTIMIZE_COMMAND: &str = "PRAGMA optimize";

/// Default pause that gives the OS time to release closed handles
pub const DEFAULT_DRAIN_PAUSE: Duration = Duration::from_millis(500);

// Upper bound on waiting for a pooled connection during a drain
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// A single connection that accepts maintenance commands
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MaintenanceConnection: Send {
    /// Run a statement and discard its rows
    async fn execute(&mut self, command: &str) -> Result<()>;

    /// Close the underlying handle; later calls are no-ops
    async fn close(&mut self) -> Result<()>;
}

/// The shared connection pool as seen by the drain coordinator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Hand out one connection, or `None` when the pool has nothing to give
    async fn get_connection(&self) -> Option<Box<dyn MaintenanceConnection>>;

    /// Close idle connections so their file handles are released.
    /// Returns how many were closed.
    async fn reclaim_idle(&self) -> usize;
}

/// Outcome of a drain, used for logging and assertions only
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    pub local_closed: usize,
    pub checkpointed: bool,
    pub optimized: bool,
    pub connection_closed: bool,
    pub idle_reclaimed: usize,
    pub warnings: Vec<String>,
}

impl DrainReport {
    fn warn(&mut self, message: String) {
        warn!("drain: {}", message);
        self.warnings.push(message);
    }
}

/// Coordinates the release of handles on the active database file
pub struct DrainCoordinator {
    /// Shared pool collaborator
    source: Arc<dyn ConnectionSource>,
    /// Connections opened outside the pool that must be closed first
    local: Mutex<Vec<Box<dyn MaintenanceConnection>>>,
    /// Reclamation pause after closing connections
    pause: Duration,
}

impl DrainCoordinator {
    /// Create a coordinator with the default reclamation pause
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source,
            local: Mutex::new(Vec::new()),
            pause: DEFAULT_DRAIN_PAUSE,
        }
    }

    /// Override the reclamation pause
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Track a connection that is not owned by the pool so the next drain closes it
    pub async fn register_local(&self, connection: Box<dyn MaintenanceConnection>) {
        self.local.lock().await.push(connection);
    }

    /// Number of local connections waiting to be closed
    pub async fn local_count(&self) -> usize {
        self.local.lock().await.len()
    }

    /// Run every drain step in order. Never fails.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        // Step 1: handles owned by this subsystem
        let locals = std::mem::take(&mut *self.local.lock().await);
        for mut connection in locals {
            match connection.close().await {
                Ok(()) => report.local_closed += 1,
                Err(e) => report.warn(format!("failed to close local connection: {}", e)),
            }
        }

        // Step 2: checkpoint and optimize through one pooled connection, then close it
        match self.source.get_connection().await {
            Some(mut connection) => {
                match connection.execute(CHECKPOINT_COMMAND).await {
                    Ok(()) => report.checkpointed = true,
                    Err(e) => report.warn(format!("checkpoint failed: {}", e)),
                }
                match connection.execute(OPTIMIZE_COMMAND).await {
                    Ok(()) => report.optimized = true,
                    Err(e) => report.warn(format!("optimize failed: {}", e)),
                }
                match connection.close().await {
                    Ok(()) => report.connection_closed = true,
                    Err(e) => report.warn(format!("failed to close pooled connection: {}", e)),
                }
            }
            None => report.warn(String::from("no pooled connection available for checkpoint")),
        }

        // Step 3: reclaim idle handles and give the OS a moment
        report.idle_reclaimed = self.source.reclaim_idle().await;
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }

        info!(
            local_closed = report.local_closed,
            checkpointed = report.checkpointed,
            idle_reclaimed = report.idle_reclaimed,
            warnings = report.warnings.len(),
            "drain finished"
        );
        report
    }
}

/// Pooled connection handed out for maintenance
struct PooledMaintenance {
    conn: Option<PoolConnection<Sqlite>>,
}

#[async_trait]
impl MaintenanceConnection for PooledMaintenance {
    async fn execute(&mut self, command: &str) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DatabaseError::Sqlite(String::from("connection already closed")))?;
        (&mut **conn).execute(command).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Detach so the handle is really closed instead of returned to the pool
        if let Some(conn) = self.conn.take() {
            conn.detach().close().await?;
        }
        Ok(())
    }
}

/// Standalone connection opened outside the pool
pub struct LocalConnection {
    conn: Option<SqliteConnection>,
}

impl LocalConnection {
    /// Open a standalone connection on the database file
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path);
        let conn = SqliteConnection::connect_with(&options).await?;
        Ok(Self { conn: Some(conn) })
    }
}

#[async_trait]
impl MaintenanceConnection for LocalConnection {
    async fn execute(&mut self, command: &str) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DatabaseError::Sqlite(String::from("connection already closed")))?;
        conn.execute(command).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

/// Connection source backed by the application's shared SQLite pool.
///
/// The pool can be swapped after a restore so that later connections open
/// the restored file.
pub struct SqlitePoolSource {
    pool: RwLock<DbPool>,
}

impl SqlitePoolSource {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool: RwLock::new(pool),
        }
    }

    /// Current pool handle
    pub fn pool(&self) -> DbPool {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Install a new pool and return the previous one
    pub fn replace(&self, pool: DbPool) -> DbPool {
        let mut guard = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, pool)
    }
}

#[async_trait]
impl ConnectionSource for SqlitePoolSource {
    async fn get_connection(&self) -> Option<Box<dyn MaintenanceConnection>> {
        let pool = self.pool();
        if pool.is_closed() {
            debug!("pool is closed, nothing to drain");
            return None;
        }

        match tokio::time::timeout(ACQUIRE_TIMEOUT, pool.acquire()).await {
            Ok(Ok(conn)) => Some(Box::new(PooledMaintenance { conn: Some(conn) })),
            Ok(Err(e)) => {
                warn!(error = %e, "could not acquire pooled connection");
                None
            }
            Err(_) => {
                warn!(timeout_ms = ACQUIRE_TIMEOUT.as_millis() as u64, "timed out acquiring pooled connection");
                None
            }
        }
    }

    async fn reclaim_idle(&self) -> usize {
        let pool = self.pool();
        let mut closed = 0;

        for _ in 0..pool.num_idle() {
            let Some(conn) = pool.try_acquire() else {
                break;
            };
            match conn.detach().close().await {
                Ok(()) => closed += 1,
                Err(e) => warn!(error = %e, "failed to close idle connection"),
            }
        }

        debug!(closed, "reclaimed idle connections");
        closed
    }
}
