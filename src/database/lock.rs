//! Exclusive-lock probe for the active database file

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use tracing::debug;

/// Outcome of a lock probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    /// Whether the file exists
    pub exists: bool,
    /// Whether another handle holds the file in a conflicting mode
    pub locked: bool,
}

/// Report whether `path` is currently held open or locked by someone else.
///
/// Opens the file read/write and tries a non-blocking exclusive lock. Only a
/// sharing or lock violation counts as locked; any other failure reports
/// `locked = false`. The probe's own lock is released when the handle drops.
pub fn probe(path: &Path) -> LockState {
    let state = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => LockState {
            exists: true,
            locked: try_exclusive(&file),
        },
        Err(e) if is_lock_violation(&e) => LockState {
            exists: true,
            locked: true,
        },
        Err(e) => {
            debug!(path = %path.display(), error = %e, "lock probe could not open file");
            LockState {
                exists: path.exists(),
                locked: false,
            }
        }
    };

    debug!(path = %path.display(), exists = state.exists, locked = state.locked, "lock probe");
    state
}

fn try_exclusive(file: &File) -> bool {
    match file.try_lock_exclusive() {
        Ok(()) => false,
        Err(e) => is_lock_violation(&e),
    }
}

fn is_lock_violation(error: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION and ERROR_LOCK_VIOLATION
    if cfg!(windows) && matches!(error.raw_os_error(), Some(32) | Some(33)) {
        return true;
    }
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file() {
        let temp_dir = tempdir().unwrap();
        let state = probe(&temp_dir.path().join("absent.db"));
        assert_eq!(state, LockState { exists: false, locked: false });
    }

    #[test]
    fn test_unlocked_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("app.db");
        std::fs::write(&path, b"data").unwrap();

        assert_eq!(probe(&path), LockState { exists: true, locked: false });
        // The probe must not leave its own lock behind
        assert_eq!(probe(&path), LockState { exists: true, locked: false });
    }

    #[cfg(unix)]
    #[test]
    fn test_file_held_exclusively_elsewhere() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("app.db");
        std::fs::write(&path, b"data").unwrap();

        let holder = File::open(&path).unwrap();
        holder.lock_exclusive().unwrap();
        assert_eq!(probe(&path), LockState { exists: true, locked: true });

        drop(holder);
        assert_eq!(probe(&path), LockState { exists: true, locked: false });
    }
}
