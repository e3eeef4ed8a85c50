//! Append-only audit trail of routing decisions
//!
//! One JSON object per line. Entries are never rewritten in place; the
//! compactor moves old ones into daily summaries and monthly archives.

use crate::config::Config;
use crate::error::AppResult;
use crate::store::JsonLinesLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One routing decision as written to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingLogEntry {
    /// ISO-8601 with `Z` suffix
    pub timestamp: String,
    pub session_id: Option<String>,
    pub intent: String,
    pub complexity: String,
    pub model_selected: String,
    pub model_used: String,
    pub fallback_triggered: bool,
    /// Machine-readable reason code
    pub reason: String,
    pub context_tokens: u64,
    pub latency_ms: f64,
}

impl RoutingLogEntry {
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Counts over a set of log entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionTally {
    pub total_requests: u64,
    pub by_model: BTreeMap<String, u64>,
    pub by_intent: BTreeMap<String, u64>,
    pub fallbacks_triggered: u64,
}

impl DecisionTally {
    pub fn add(&mut self, entry: &RoutingLogEntry) {
        self.total_requests += 1;
        *self.by_model.entry(entry.model_used.clone()).or_default() += 1;
        *self.by_intent.entry(entry.intent.clone()).or_default() += 1;
        if entry.fallback_triggered {
            self.fallbacks_triggered += 1;
        }
    }

    /// Add another tally's counts into this one
    pub fn merge(&mut self, other: &DecisionTally) {
        self.total_requests += other.total_requests;
        for (model, n) in &other.by_model {
            *self.by_model.entry(model.clone()).or_default() += n;
        }
        for (intent, n) in &other.by_intent {
            *self.by_intent.entry(intent.clone()).or_default() += n;
        }
        self.fallbacks_triggered += other.fallbacks_triggered;
    }
}

pub struct DecisionLog {
    log: JsonLinesLog,
}

impl DecisionLog {
    pub fn new(config: &Config) -> Self {
        Self {
            log: JsonLinesLog::new(config.state.decision_log_path()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.log.path()
    }

    pub fn append(&self, entry: &RoutingLogEntry) -> AppResult<()> {
        self.log.append(entry)
    }

    /// All parseable entries in file order
    pub fn read_entries(&self) -> AppResult<Vec<RoutingLogEntry>> {
        let lines = self.log.read_lines()?;
        let total = lines.len();
        let entries: Vec<RoutingLogEntry> = lines
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if entries.len() < total {
            tracing::debug!(
                skipped = total - entries.len(),
                "Skipped unparseable decision log lines"
            );
        }
        Ok(entries)
    }

    pub fn stats(&self) -> AppResult<DecisionTally> {
        let mut tally = DecisionTally::default();
        for entry in self.read_entries()? {
            tally.add(&entry);
        }
        Ok(tally)
    }
}
