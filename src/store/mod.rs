//! Persistent state shared across processes
//!
//! Every state file has a sibling `<file>.lock`. A read-modify-write cycle
//! holds an exclusive `flock` on that sibling for its whole duration; the
//! guard is scoped, so the lock is released on every exit path including
//! early returns and unwinding. Acquisition blocks until the lock is free.

pub mod json;
pub mod jsonl;

pub use json::JsonStore;
pub use jsonl::JsonLinesLog;

use crate::error::{AppError, AppResult};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Path of the lock file guarding `path`
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Handle to the lock file guarding one state file
pub struct FileLock {
    lock: fd_lock::RwLock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if needed) the lock file guarding `state_path`
    pub fn open(state_path: &Path) -> AppResult<Self> {
        let path = lock_path_for(state_path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| AppError::state_io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| AppError::state_io(&path, e))?;
        Ok(Self {
            lock: fd_lock::RwLock::new(file),
            path,
        })
    }

    /// Block until the exclusive lock is held
    pub fn exclusive(&mut self) -> AppResult<fd_lock::RwLockWriteGuard<'_, File>> {
        let path = self.path.clone();
        self.lock.write().map_err(|e| AppError::state_io(&path, e))
    }

    /// Block until a shared lock is held
    pub fn shared(&self) -> AppResult<fd_lock::RwLockReadGuard<'_, File>> {
        self.lock.read().map_err(|e| AppError::state_io(&self.path, e))
    }
}

/// Run `f` while holding the exclusive lock for `state_path`
///
/// Do not nest calls for the same path on one thread: each call opens its
/// own descriptor, and `flock` locks on separate descriptors conflict.
pub fn with_exclusive<R>(state_path: &Path, f: impl FnOnce() -> AppResult<R>) -> AppResult<R> {
    let mut lock = FileLock::open(state_path)?;
    let _guard = lock.exclusive()?;
    f()
}

/// Run `f` while holding a shared lock for `state_path`
pub fn with_shared<R>(state_path: &Path, f: impl FnOnce() -> AppResult<R>) -> AppResult<R> {
    let lock = FileLock::open(state_path)?;
    let _guard = lock.shared()?;
    f()
}

/// Replace `path` with `contents` via a temp file and rename
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| AppError::state_io(parent, e))?;
    }
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents).map_err(|e| AppError::state_io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| AppError::state_io(path, e))
}

/// Current wall-clock time as ISO-8601 with a `Z` suffix
pub fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// ISO-8601 rendering of an epoch-millis instant; falls back to now when out of range
pub fn iso_from_ms(epoch_ms: f64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(iso_now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_iso_from_ms_uses_z_suffix() {
        assert_eq!(iso_from_ms(1_500.0), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/state/rate_limits.json")),
            PathBuf::from("/tmp/state/rate_limits.json.lock")
        );
    }

    #[test]
    fn test_with_exclusive_creates_lock_file_and_returns_value() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("nested").join("state.json");
        let value = with_exclusive(&state, || Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert!(lock_path_for(&state).exists());
    }

    #[test]
    fn test_lock_released_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let result: AppResult<()> =
            with_exclusive(&state, || Err(AppError::Internal("boom".to_string())));
        assert!(result.is_err());

        // A second acquisition must not block
        assert_eq!(with_exclusive(&state, || Ok("again")).unwrap(), "again");
    }

    #[test]
    fn test_exclusive_sections_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(dir.path().join("state.json"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        with_exclusive(&state, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }
}
