use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::path::{Path, PathBuf};

// Scheme prefix used for persisted connection strings
const SQLITE_SCHEME: &str = "sqlite:";

// Database connection pool type
pub type DbPool = Pool<Sqlite>;

/// Open a WAL-mode connection pool on the given database file
pub async fn open_pool(path: &Path) -> Result<DbPool, sqlx::Error> {
    // Set up connection options
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // Create connection pool
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Build the connection string persisted for a database file
pub fn connection_string(path: &Path) -> String {
    format!("{}{}", SQLITE_SCHEME, path.display())
}

/// Extract the database file path from a persisted connection string
///
/// Accepts `sqlite:path`, `sqlite://path` and a bare path. Query parameters
/// are dropped. In-memory databases have no file and yield `None`.
pub fn database_path_from_url(url: &str) -> Option<PathBuf> {
    let url = url.trim();
    let rest = url.strip_prefix(SQLITE_SCHEME).unwrap_or(url);
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let rest = rest.split('?').next().unwrap_or_default();

    if rest.is_empty() || rest == ":memory:" {
        return None;
    }
    Some(PathBuf::from(rest))
}
