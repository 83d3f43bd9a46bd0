//! Filesystem entry fingerprints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Fingerprint of a filesystem entry at a point in time.
///
/// Two fingerprints are equal iff size, modification time, and kind all
/// match. A fingerprint is captured once by probing the entry and never
/// mutated; the next build compares it against a fresh probe to decide
/// whether the entry changed. A missing entry probes to the all-zero state,
/// so "file appeared" and "file vanished" both register as changes.
/// The `Default` state is the all-zero probe of a missing entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct FileState {
    /// Size in bytes, `0` when missing.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch, `0` when
    /// missing or unavailable.
    pub mtime: i64,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

impl FileState {
    /// Probes the entry at `path`.
    pub fn of(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => Self {
                size: meta.len(),
                mtime: mtime_millis(&meta),
                is_directory: meta.is_dir(),
            },
            Err(_) => Self {
                size: 0,
                mtime: 0,
                is_directory: false,
            },
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes, {}", self.size, self.mtime)
    }
}

/// Extracts a file's mtime as milliseconds since the Unix epoch.
pub(crate) fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        },
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "12345").unwrap();

        let state = FileState::of(&path);
        assert_eq!(state.size, 5);
        assert!(state.mtime > 0);
        assert!(!state.is_directory);
    }

    #[test]
    fn probe_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = FileState::of(dir.path());
        assert!(state.is_directory);
    }

    #[test]
    fn probe_missing_is_zero() {
        let state = FileState::of(Path::new("/nonexistent/entry"));
        assert_eq!(
            state,
            FileState {
                size: 0,
                mtime: 0,
                is_directory: false
            }
        );
    }

    #[test]
    fn content_change_changes_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "1").unwrap();
        let before = FileState::of(&path);

        std::fs::write(&path, "11").unwrap();
        let after = FileState::of(&path);
        assert_ne!(before, after);
    }

    #[test]
    fn unchanged_file_is_equal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "stable").unwrap();

        assert_eq!(FileState::of(&path), FileState::of(&path));
    }
}
