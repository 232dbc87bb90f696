//! Key/value configuration store and connection-string repointing
//!
//! The store is a dotenv-style `KEY=value` file. Repointing reads the whole
//! document, swaps the `DATABASE_URL` assignment line and writes the document
//! back through a temporary sibling. Every other line, comments and blank
//! lines included, is carried over byte for byte; values are never parsed
//! and regenerated, so `$VAR` references and escapes survive untouched.

use std::path::{Path, PathBuf};

use tokio::fs as tokio_fs;
use tracing::{debug, info, warn};

use crate::database::{DATABASE_URL_KEY, DatabaseError, Result};
use crate::db;

/// A file-backed key/value configuration document
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file exists
    pub async fn exists(&self) -> bool {
        tokio_fs::metadata(&self.path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
    }

    /// Read the raw document
    pub async fn read_document(&self) -> Result<String> {
        Ok(tokio_fs::read_to_string(&self.path).await?)
    }

    /// Look up a single key
    ///
    /// Only the matching assignment line goes through the dotenv parser, so
    /// lines it would reject elsewhere in the document do not matter.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let document = self.read_document().await?;
        match find_assignment(&document, key) {
            Some(line) => parse_assignment(line).map(Some).map_err(|e| {
                DatabaseError::Config(format!("Failed to parse {} in {}: {}", key, self.path.display(), e))
            }),
            None => Ok(None),
        }
    }

    /// Set `key` to `value`, leaving every other line as it was
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let document = self.read_document().await?;
        self.write_document(&with_assignment(&document, key, value)).await
    }

    /// Replace the whole document through a temporary sibling file
    pub async fn write_document(&self, document: &str) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| DatabaseError::Config(format!("{} is not a file path", self.path.display())))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        tokio_fs::write(&temp_path, document).await?;
        if let Err(e) = tokio_fs::rename(&temp_path, &self.path).await {
            let _ = tokio_fs::remove_file(&temp_path).await;
            return Err(DatabaseError::Io(e));
        }
        Ok(())
    }
}

// Key of a `KEY=value` or `export KEY=value` line; comments have none
fn assignment_key(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, _) = line.split_once('=')?;
    let key = key.trim_end();

    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    valid.then_some(key)
}

fn find_assignment<'a>(document: &'a str, key: &str) -> Option<&'a str> {
    document
        .lines()
        .find(|line| assignment_key(line) == Some(key))
}

fn parse_assignment(line: &str) -> std::result::Result<String, dotenv::Error> {
    match dotenv::from_read_iter(line.as_bytes()).next() {
        Some(item) => item.map(|(_, value)| value),
        None => Ok(String::new()),
    }
}

/// Replace every `key=` assignment line in `document`, or append one
///
/// Other lines and each line's original terminator are kept as they are.
pub fn with_assignment(document: &str, key: &str, value: &str) -> String {
    let replacement = format!("{}={}", key, quote_value(value));
    let mut output = String::with_capacity(document.len() + replacement.len() + 1);
    let mut replaced = false;

    for line in document.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        if assignment_key(body) == Some(key) {
            output.push_str(&replacement);
            output.push_str(&line[body.len()..]);
            replaced = true;
        } else {
            output.push_str(line);
        }
    }

    if !replaced {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&replacement);
        output.push('\n');
    }
    output
}

// Quote values the dotenv parser would otherwise reinterpret
fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ":/._-+,@%~".contains(c));
    if plain {
        value.to_string()
    } else if !value.contains('\'') {
        format!("'{}'", value)
    } else {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$");
        format!("\"{}\"", escaped)
    }
}

/// Rewrites the persisted connection string to point at a new database file
#[derive(Debug, Clone)]
pub struct ConfigRepointer {
    /// Source of truth for the connection string
    primary: ConfigStore,
    /// Optional deployed copy kept in sync on a best-effort basis
    secondary: Option<ConfigStore>,
}

impl ConfigRepointer {
    pub fn new(primary: ConfigStore, secondary: Option<ConfigStore>) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &ConfigStore {
        &self.primary
    }

    /// Database file currently named by the primary store, if any
    pub async fn active_database(&self) -> Option<PathBuf> {
        if !self.primary.exists().await {
            return None;
        }
        match self.primary.get(DATABASE_URL_KEY).await {
            Ok(Some(url)) => db::database_path_from_url(&url),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "could not read active database from configuration");
                None
            }
        }
    }

    /// Persist a connection string for `database` in the primary store and mirror it
    ///
    /// Returns the connection string written. Only the primary write can fail
    /// the operation.
    pub async fn repoint(&self, database: &Path) -> Result<String> {
        let url = db::connection_string(database);
        let primary_path = self.primary.path().to_path_buf();

        if !self.primary.exists().await {
            return Err(DatabaseError::ConfigWrite {
                path: primary_path,
                reason: String::from("configuration file not found"),
            });
        }

        self.primary
            .set(DATABASE_URL_KEY, &url)
            .await
            .map_err(|e| DatabaseError::ConfigWrite {
                path: primary_path.clone(),
                reason: e.to_string(),
            })?;
        info!(config = %primary_path.display(), url = %url, "configuration repointed");

        if let Some(secondary) = &self.secondary {
            if secondary.exists().await {
                match secondary.set(DATABASE_URL_KEY, &url).await {
                    Ok(()) => info!(config = %secondary.path().display(), "secondary configuration repointed"),
                    Err(e) => warn!(
                        config = %secondary.path().display(),
                        error = %e,
                        "failed to mirror connection string to secondary configuration"
                    ),
                }
            } else {
                debug!(config = %secondary.path().display(), "no secondary configuration to mirror");
            }
        }

        Ok(url)
    }
}
