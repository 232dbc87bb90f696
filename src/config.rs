use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::database::DATABASE_PATH;
use crate::database::drain::DEFAULT_DRAIN_PAUSE;

/// Configuration for snapshot and live restore functionality
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Database file used when the configuration store names none
    pub database_path: PathBuf,
    /// Primary key/value configuration store holding the connection string
    pub config_file: PathBuf,
    /// Deployed copy of the configuration store, mirrored on repoint
    pub secondary_config_file: Option<PathBuf>,
    /// Declared resource directory searched when the database file is missing
    pub resource_dir: PathBuf,
    /// Pause after draining connections
    pub drain_pause: Duration,
    /// Local directory receiving snapshots
    pub local_backup_dir: PathBuf,
    /// Address the web interface binds to
    pub listen_addr: String,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DATABASE_PATH),
            config_file: PathBuf::from(".env"),
            secondary_config_file: None,
            resource_dir: PathBuf::from("resources"),
            drain_pause: DEFAULT_DRAIN_PAUSE,
            local_backup_dir: PathBuf::from("./backups"),
            listen_addr: String::from("0.0.0.0:8080"),
        }
    }
}

impl RestoreConfig {
    /// Load restore configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let config_file = env::var("CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_file);

        let secondary_config_file = env::var("SECONDARY_CONFIG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let resource_dir = env::var("RESOURCE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.resource_dir);

        let drain_pause = env::var("DRAIN_PAUSE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_pause);

        let local_backup_dir = env::var("BACKUP_LOCAL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.local_backup_dir);

        let listen_addr = env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr);

        Self {
            database_path,
            config_file,
            secondary_config_file,
            resource_dir,
            drain_pause,
            local_backup_dir,
            listen_addr,
        }
    }

    /// Ensure local backup directory exists
    pub fn ensure_local_backup_dir(&self) -> std::io::Result<()> {
        if !self.local_backup_dir.exists() {
            std::fs::create_dir_all(&self.local_backup_dir)?;
        }
        Ok(())
    }
}
