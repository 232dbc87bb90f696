//! Live backup and restore for a file-backed SQLite database
//!
//! A restore swaps the application onto a backup snapshot while it keeps
//! running: the shared pool is drained, the snapshot is copied next to the
//! live file and the persisted connection string is repointed at the copy.

pub mod config;
pub mod database;
pub mod db;

pub use database::restore::{BackupResult, RestoreExecutor};
