//! Locked append-only JSON Lines file

use super::{with_exclusive, with_shared};
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only log of one JSON object per line
#[derive(Debug, Clone)]
pub struct JsonLinesLog {
    path: PathBuf,
}

impl JsonLinesLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record under the exclusive lock
    pub fn append<T: Serialize>(&self, record: &T) -> AppResult<()> {
        let mut line = serde_json::to_string(record).map_err(|source| AppError::StateEncode {
            path: self.path.display().to_string(),
            source,
        })?;
        line.push('\n');
        with_exclusive(&self.path, || append_raw(&self.path, &line))
    }

    /// All raw lines under a shared lock (blank lines dropped)
    pub fn read_lines(&self) -> AppResult<Vec<String>> {
        with_shared(&self.path, || read_lines_unlocked(&self.path))
    }
}

/// Append already-formatted text; caller holds the lock
pub(crate) fn append_raw(path: &Path, text: &str) -> AppResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| AppError::state_io(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppError::state_io(path, e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| AppError::state_io(path, e))
}

/// Read non-blank lines; caller holds the lock
pub(crate) fn read_lines_unlocked(path: &Path) -> AppResult<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(AppError::state_io(path, e)),
    }
}
