//! Locked JSON document store

use super::{with_exclusive, with_shared, write_atomic};
use crate::error::{AppError, AppResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// One JSON document on disk, read and written under its file lock
///
/// A missing, empty or unparseable file reads as `T::default()`; corruption
/// is logged and then overwritten by the next successful write.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document under a shared lock
    pub fn load(&self) -> AppResult<T> {
        with_shared(&self.path, || self.read_unlocked())
    }

    /// Read-modify-write under the exclusive lock, always persisting
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> AppResult<R> {
        self.transact(|doc| (f(doc), true))
    }

    /// Read-modify-write under the exclusive lock
    ///
    /// `f` returns its result and whether the document changed; unchanged
    /// documents are not rewritten.
    pub fn transact<R>(&self, f: impl FnOnce(&mut T) -> (R, bool)) -> AppResult<R> {
        with_exclusive(&self.path, || {
            let mut doc = self.read_unlocked()?;
            let (result, changed) = f(&mut doc);
            if changed {
                self.write_unlocked(&doc)?;
            }
            Ok(result)
        })
    }

    fn read_unlocked(&self) -> AppResult<T> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(AppError::state_io(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        match serde_json::from_str(&content) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "State file is corrupt, starting from an empty document"
                );
                Ok(T::default())
            }
        }
    }

    fn write_unlocked(&self, doc: &T) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| AppError::StateEncode {
            path: self.path.display().to_string(),
            source,
        })?;
        write_atomic(&self.path, &bytes)
    }
}
