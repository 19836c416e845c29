//! Tracks the last time each session read each file, so `edit`/`write` can
//! refuse a stale write (the file changed on disk since this session last
//! looked at it). A `RwLock<HashMap<K, V>>` guarding small Copy-ish state,
//! with one method per lifecycle event (note/assert/forget).

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;

use sa_domain::error::{Error, Result};

/// `(session, path) -> last-read mtime` registry.
///
/// Invariant: a path never appears "fresh" for a session that hasn't read it.
/// `assert_fresh` is conservative on that side — no recorded read is treated
/// the same as a stale one, since there's nothing to compare against.
#[derive(Default)]
pub struct FileTimeGuard {
    reads: RwLock<HashMap<(String, String), SystemTime>>,
}

impl FileTimeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_read(&self, session_id: &str, path: &str) {
        self.reads.write().insert(
            (session_id.to_string(), path.to_string()),
            SystemTime::now(),
        );
    }

    /// Compare the recorded read time against the file's current mtime.
    /// Errors with [`Error::PermissionDenied`] if the file was modified after
    /// this session last read it, or if this session never read it at all.
    pub fn assert_fresh(&self, session_id: &str, path: &str) -> Result<()> {
        let key = (session_id.to_string(), path.to_string());
        let last_read = self
            .reads
            .read()
            .get(&key)
            .copied()
            .ok_or_else(|| Error::PermissionDenied(format!("{path}: not read this session yet")))?;

        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| Error::Other(format!("{path}: {e}")))?;

        if mtime > last_read {
            return Err(Error::PermissionDenied(format!(
                "{path}: modified on disk since last read"
            )));
        }
        Ok(())
    }

    /// Drop every entry for a session once it's removed, so the map doesn't
    /// grow without bound across a long-running process.
    pub fn forget_session(&self, session_id: &str) {
        self.reads.write().retain(|(sid, _), _| sid != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unread_path_is_not_fresh() {
        let guard = FileTimeGuard::new();
        let err = guard.assert_fresh("ses_1", "/tmp/does-not-matter").unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn read_then_assert_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "v1").unwrap();

        let guard = FileTimeGuard::new();
        guard.note_read("ses_1", path.to_str().unwrap());
        assert!(guard.assert_fresh("ses_1", path.to_str().unwrap()).is_ok());
    }

    #[test]
    fn modification_after_read_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "v1").unwrap();

        let guard = FileTimeGuard::new();
        guard.note_read("ses_1", path.to_str().unwrap());

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "v2").unwrap();

        let err = guard.assert_fresh("ses_1", path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn forget_session_clears_its_entries_only() {
        let guard = FileTimeGuard::new();
        guard.note_read("ses_1", "/a");
        guard.note_read("ses_2", "/a");
        guard.forget_session("ses_1");
        assert_eq!(guard.reads.read().len(), 1);
        assert!(guard.reads.read().contains_key(&("ses_2".to_string(), "/a".to_string())));
    }
}
