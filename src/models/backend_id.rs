//! Type-safe backend identifier
//!
//! Provides validation and type safety for backend ids used throughout the
//! routing system, particularly in the planner's set of attempted backends.

use crate::config::{BackendConfig, Config};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type-safe wrapper for backend ids
///
/// # Preferred Usage
/// - **Production code with Config**: `BackendId::new(id, config)` for validated construction
/// - **Production code with BackendConfig**: `BackendId::from(backend)` (always valid)
/// - **Test code**: `From<String>` / `From<&str>`, which do not validate
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    /// Create a validated BackendId
    ///
    /// # Errors
    /// Returns an error if the id doesn't match any configured backend.
    pub fn new(id: String, config: &Config) -> Result<Self, String> {
        let backend_id = Self(id);
        if backend_id.is_valid(config) {
            Ok(backend_id)
        } else {
            Err(format!(
                "Unknown backend: '{}'. Available backends: {}",
                backend_id.0,
                Self::list_available(config).join(", ")
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id names a configured backend
    pub fn is_valid(&self, config: &Config) -> bool {
        config.backend(&self.0).is_some()
    }

    fn list_available(config: &Config) -> Vec<String> {
        config.backends.iter().map(|b| b.id.clone()).collect()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&BackendConfig> for BackendId {
    fn from(backend: &BackendConfig) -> Self {
        Self(backend.id.clone())
    }
}

impl From<String> for BackendId {
    /// Note: This does NOT validate that the backend exists in the configuration.
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for BackendId {
    /// Note: This does NOT validate that the backend exists in the configuration.
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for BackendId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
