//! Model-availability cache
//!
//! Last observed availability per backend, written when the planner hears
//! back from the executor and pruned by the compactor once stale.

use crate::config::Config;
use crate::error::AppResult;
use crate::store::JsonStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cached availability for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityEntry {
    /// Epoch seconds
    pub checked_at: f64,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// On-disk availability cache document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityCache {
    /// Epoch seconds of the last stale-entry sweep
    #[serde(default)]
    pub last_refresh: f64,
    #[serde(default)]
    pub models: BTreeMap<String, AvailabilityEntry>,
}

/// Current wall-clock time in epoch seconds
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct ModelAvailability {
    store: JsonStore<AvailabilityCache>,
}

impl ModelAvailability {
    pub fn new(config: &Config) -> Self {
        Self {
            store: JsonStore::new(config.state.availability_cache_path()),
        }
    }

    pub fn store(&self) -> &JsonStore<AvailabilityCache> {
        &self.store
    }

    pub fn mark(&self, backend: &str, available: bool, last_error: Option<&str>) -> AppResult<()> {
        self.mark_at(backend, available, last_error, now_secs())
    }

    pub fn mark_at(
        &self,
        backend: &str,
        available: bool,
        last_error: Option<&str>,
        now: f64,
    ) -> AppResult<()> {
        self.store.update(|cache| {
            cache.models.insert(
                backend.to_string(),
                AvailabilityEntry {
                    checked_at: now,
                    available,
                    last_error: last_error.map(str::to_string),
                },
            );
        })
    }

    pub fn get(&self, backend: &str) -> AppResult<Option<AvailabilityEntry>> {
        Ok(self.store.load()?.models.remove(backend))
    }
}
