//! Path resolution for the active database file and restore targets
//!
//! Paths arrive from form fields, command lines and persisted connection
//! strings, so they may carry stray whitespace, scheme prefixes, UNC-style
//! double separators or the other platform's separator. Everything is
//! normalized here before the restore touches the filesystem.

use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use crate::database::{DatabaseError, Result};

/// Misspelled resource directory still found on older installs
pub const LEGACY_RESOURCE_DIR: &str = "resouces";

/// Suffix appended to the active file stem to name the restore target
pub const RESTORE_TARGET_SUFFIX: &str = "-new";

/// Normalize a raw path string into an absolute path for this platform
pub fn normalize_path(raw: &str) -> Result<PathBuf> {
    let mut value = raw.trim();
    if let Some(rest) = value.strip_prefix("file:") {
        value = rest;
    }
    let value = value.trim_start_matches(':').trim();

    if value.is_empty() {
        return Err(DatabaseError::InvalidPath(format!(
            "'{}' is empty after trimming",
            raw
        )));
    }

    let unified: String = value
        .chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect();

    // Collapse `\\server`, `//x` and `file:///x` style prefixes to a single root
    let body = unified.trim_start_matches(MAIN_SEPARATOR);
    let rooted = body.len() != unified.len();
    let candidate = if rooted && !(cfg!(windows) && has_drive_prefix(body)) {
        format!("{}{}", MAIN_SEPARATOR, body)
    } else {
        body.to_string()
    };

    // Rebuilding from components drops doubled separators and `.` segments
    let path: PathBuf = Path::new(&candidate).components().collect();
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn has_drive_prefix(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Ordered directories probed when the configured database file is missing
pub fn fallback_candidates(resource_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![resource_dir.to_path_buf(), PathBuf::from(LEGACY_RESOURCE_DIR)];
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd);
    }
    candidates
}

/// Return the first candidate directory that contains `file_name`
///
/// Used only to enrich diagnostics; a hit is never substituted for the
/// path the user or the configuration asked for.
pub fn find_in_candidates<P: AsRef<Path>>(file_name: &str, candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|dir| dir.as_ref().join(file_name))
        .find(|path| path.is_file())
}

/// Compute the restore target for the given active database file
///
/// The target is a sibling with `-new` appended to the file stem, so
/// `/data/app.db` restores into `/data/app-new.db`. The name is fixed:
/// restoring twice against the same active file overwrites the earlier
/// target, while a repointed active file yields a fresh name.
pub fn restore_target_for(active: &Path) -> PathBuf {
    let stem = active
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("database"));

    let file_name = match active.extension() {
        Some(ext) => format!("{}{}.{}", stem, RESTORE_TARGET_SUFFIX, ext.to_string_lossy()),
        None => format!("{}{}", stem, RESTORE_TARGET_SUFFIX),
    };

    active.with_file_name(file_name)
}
