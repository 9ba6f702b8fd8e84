//! Per-worker filesystem state.
//!
//! The bridge keeps a small amount of on-disk state per worker under
//! `<node>/sessions/<worker>/`:
//!
//! - `chat_id` — the chat that last addressed this worker
//! - `pending` — Unix-seconds timestamp of an outstanding request
//! - `inbox/` — files forwarded from the chat
//!
//! Everything is plain files, no locks. Directories are created 0700 and
//! files 0600. The pending marker self-expires: a reader that finds a stale
//! timestamp removes the file and reports "not pending".

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::error::{BridgeError, Result};

/// Age after which a pending marker no longer counts.
pub const PENDING_TTL: Duration = Duration::from_secs(600);

/// Inbox files older than this are swept by the periodic cleanup.
pub const INBOX_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle on one node's `sessions/` tree.
#[derive(Debug, Clone)]
pub struct FileStore {
    sessions_dir: PathBuf,
}

impl FileStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn worker_dir(&self, worker: &str) -> PathBuf {
        self.sessions_dir.join(worker)
    }

    pub fn inbox_dir(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("inbox")
    }

    // ── Pending marker ──────────────────────────────────────────────

    /// Mark a request as outstanding for `worker` (now, in Unix seconds).
    pub fn set_pending(&self, worker: &str) -> Result<()> {
        let dir = self.worker_dir(worker);
        ensure_dir(&dir)?;
        let ts = chrono::Utc::now().timestamp();
        write_private(&dir.join("pending"), ts.to_string().as_bytes())
    }

    /// True iff a pending marker exists and is at most [`PENDING_TTL`] old.
    /// An expired or unreadable marker is removed on the spot.
    pub fn is_pending(&self, worker: &str) -> bool {
        let path = self.worker_dir(worker).join("pending");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let fresh = content
            .trim()
            .parse::<i64>()
            .map(|ts| chrono::Utc::now().timestamp() - ts <= PENDING_TTL.as_secs() as i64)
            .unwrap_or(false);
        if !fresh {
            let _ = fs::remove_file(&path);
        }
        fresh
    }

    /// Remove the pending marker if present; absence is not an error.
    pub fn clear_pending(&self, worker: &str) -> Result<()> {
        let path = self.worker_dir(worker).join("pending");
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::io(path, e)),
        }
    }

    // ── Chat-ID mapping ─────────────────────────────────────────────

    pub fn save_chat_id(&self, worker: &str, chat_id: &str) -> Result<()> {
        let dir = self.worker_dir(worker);
        ensure_dir(&dir)?;
        write_private(&dir.join("chat_id"), chat_id.as_bytes())
    }

    /// Last chat that addressed `worker`. An empty file counts as absent.
    pub fn get_chat_id(&self, worker: &str) -> Option<String> {
        let content = fs::read_to_string(self.worker_dir(worker).join("chat_id")).ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// All chat ids ever saved, deduplicated and sorted lexicographically.
    pub fn get_all_chat_ids(&self) -> Vec<String> {
        let mut ids = std::collections::BTreeSet::new();
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = self.get_chat_id(name) {
                    ids.insert(id);
                }
            }
        }
        ids.into_iter().collect()
    }

    // ── Inbox ───────────────────────────────────────────────────────

    /// Save bytes into a worker's inbox. Never overwrites: on a name
    /// collision the nanosecond timestamp is appended before the extension.
    pub fn save_file(&self, worker: &str, filename: &str, data: &[u8]) -> Result<PathBuf> {
        let inbox = self.inbox_dir(worker);
        ensure_dir(&inbox)?;

        // Keep only the basename; chat-supplied names may carry separators.
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .unwrap_or("file");

        let mut target = inbox.join(name);
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&target)
            {
                Ok(mut f) => {
                    f.write_all(data)
                        .map_err(|e| BridgeError::io(target.clone(), e))?;
                    return Ok(target);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let nanos = chrono::Utc::now()
                        .timestamp_nanos_opt()
                        .unwrap_or_default();
                    target = inbox.join(with_timestamp(name, nanos));
                }
                Err(e) => return Err(BridgeError::io(target, e)),
            }
        }
    }

    /// Delete regular inbox files older than `max_age`. Subdirectories are
    /// left alone; a missing inbox is not an error. Returns how many files
    /// were removed.
    pub fn cleanup_inbox(&self, worker: &str, max_age: Duration) -> Result<usize> {
        let inbox = self.inbox_dir(worker);
        let entries = match fs::read_dir(&inbox) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BridgeError::io(inbox, e)),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let stale = meta
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), "inbox cleanup failed: {e}"),
                }
            }
        }
        Ok(removed)
    }

    /// Run [`FileStore::cleanup_inbox`] for every worker directory.
    pub fn cleanup_all_inboxes(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                match self.cleanup_inbox(name, max_age) {
                    Ok(n) => removed += n,
                    Err(e) => warn!(worker = name, "inbox cleanup failed: {e}"),
                }
            }
        }
        removed
    }
}

/// `name.ext` → `name_<nanos>.ext`; extensionless names get the plain suffix.
fn with_timestamp(name: &str, nanos: i64) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{nanos}.{ext}"),
        _ => format!("{name}_{nanos}"),
    }
}

/// Create a directory chain with mode 0700.
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| BridgeError::io(dir.to_path_buf(), e))
}

/// Write a file with mode 0600, replacing any previous content.
pub(crate) fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| BridgeError::io(path.to_path_buf(), e))?;
    f.write_all(data)
        .map_err(|e| BridgeError::io(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("sessions"));
        (dir, store)
    }

    #[test]
    fn test_pending_roundtrip() {
        let (_tmp, store) = store();
        assert!(!store.is_pending("alice"));
        store.set_pending("alice").unwrap();
        assert!(store.is_pending("alice"));
        store.clear_pending("alice").unwrap();
        assert!(!store.is_pending("alice"));
        // clearing again is fine
        store.clear_pending("alice").unwrap();
    }

    #[test]
    fn test_pending_expires_and_is_removed() {
        let (_tmp, store) = store();
        let dir = store.worker_dir("bob");
        ensure_dir(&dir).unwrap();
        let stale = chrono::Utc::now().timestamp() - 601;
        fs::write(dir.join("pending"), stale.to_string()).unwrap();

        assert!(!store.is_pending("bob"));
        assert!(!dir.join("pending").exists());
    }

    #[test]
    fn test_pending_garbage_is_removed() {
        let (_tmp, store) = store();
        let dir = store.worker_dir("bob");
        ensure_dir(&dir).unwrap();
        fs::write(dir.join("pending"), "not a number").unwrap();

        assert!(!store.is_pending("bob"));
        assert!(!dir.join("pending").exists());
    }

    #[test]
    fn test_chat_id_empty_is_absent() {
        let (_tmp, store) = store();
        assert_eq!(store.get_chat_id("alice"), None);
        store.save_chat_id("alice", "").unwrap();
        assert_eq!(store.get_chat_id("alice"), None);
        store.save_chat_id("alice", "42").unwrap();
        assert_eq!(store.get_chat_id("alice"), Some("42".into()));
    }

    #[test]
    fn test_all_chat_ids_deduped_sorted() {
        let (_tmp, store) = store();
        store.save_chat_id("alice", "99").unwrap();
        store.save_chat_id("bob", "100").unwrap();
        store.save_chat_id("carol", "99").unwrap();
        // lexicographic: "100" < "99"
        assert_eq!(store.get_all_chat_ids(), vec!["100", "99"]);
    }

    #[test]
    fn test_save_file_never_overwrites() {
        let (_tmp, store) = store();
        let a = store.save_file("alice", "notes.txt", b"one").unwrap();
        let b = store.save_file("alice", "notes.txt", b"two").unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read(&a).unwrap(), b"one");
        assert_eq!(fs::read(&b).unwrap(), b"two");
        let bname = b.file_name().unwrap().to_str().unwrap().to_string();
        assert!(bname.starts_with("notes_"));
        assert!(bname.ends_with(".txt"));
    }

    #[test]
    fn test_save_file_strips_directories() {
        let (_tmp, store) = store();
        let path = store.save_file("alice", "../../etc/passwd", b"x").unwrap();
        assert_eq!(path.parent().unwrap(), store.inbox_dir("alice"));
        assert_eq!(path.file_name().unwrap(), "passwd");
    }

    #[test]
    fn test_file_modes() {
        let (_tmp, store) = store();
        let path = store.save_file("alice", "f.bin", b"x").unwrap();
        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = fs::metadata(store.inbox_dir("alice"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn test_cleanup_missing_inbox_is_ok() {
        let (_tmp, store) = store();
        assert_eq!(store.cleanup_inbox("ghost", INBOX_MAX_AGE).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_skips_fresh_files_and_subdirs() {
        let (_tmp, store) = store();
        store.save_file("alice", "fresh.txt", b"x").unwrap();
        fs::create_dir_all(store.inbox_dir("alice").join("sub")).unwrap();
        assert_eq!(store.cleanup_inbox("alice", INBOX_MAX_AGE).unwrap(), 0);
        assert!(store.inbox_dir("alice").join("sub").exists());
    }

    #[test]
    fn test_cleanup_removes_stale_files() {
        let (_tmp, store) = store();
        let path = store.save_file("alice", "old.txt", b"x").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let removed = store
            .cleanup_inbox("alice", Duration::from_millis(10))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_with_timestamp_placement() {
        assert_eq!(with_timestamp("a.txt", 7), "a_7.txt");
        assert_eq!(with_timestamp("archive.tar.gz", 7), "archive.tar_7.gz");
        assert_eq!(with_timestamp("noext", 7), "noext_7");
        assert_eq!(with_timestamp(".env", 7), ".env_7");
    }
}
