//! State compaction
//!
//! Four independent maintenance operations over the shared state files.
//! Each one takes the owning file's exclusive lock, writes only when it
//! actually removes something, and can run in dry-run mode to report what
//! it would do. Running any of them twice with no activity in between is a
//! no-op the second time.

pub mod logs;

pub use logs::{DailySummary, LogCompaction};

use crate::config::{CompactionConfig, Config, StateConfig};
use crate::error::AppResult;
use crate::metrics::{Metrics, warn_on_error};
use crate::models::{AvailabilityCache, CircuitState, CircuitStore};
use crate::rate_limit::RateLimitStore;
use crate::store::{JsonStore, iso_from_ms};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// One compaction operation, in `run_all` order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Circuits,
    Logs,
    RateLimits,
    Availability,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Circuits,
        Operation::Logs,
        Operation::RateLimits,
        Operation::Availability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Circuits => "circuits",
            Operation::Logs => "logs",
            Operation::RateLimits => "rate_limits",
            Operation::Availability => "availability",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown compaction operation '{}' (expected one of: circuits, logs, rate_limits, availability)",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitCleanup {
    /// CLOSED records idle past the age limit
    pub expired: usize,
    /// Least-recently-active records over the count cap
    pub evicted: usize,
    pub remaining: usize,
}

impl CircuitCleanup {
    pub fn affected(&self) -> usize {
        self.expired + self.evicted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitReset {
    /// Users idle past the reset window
    pub removed: usize,
    /// Surviving users whose timestamp lists shrank
    pub pruned: usize,
    pub remaining: usize,
}

impl RateLimitReset {
    pub fn affected(&self) -> usize {
        self.removed + self.pruned
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRefresh {
    pub removed: usize,
    pub remaining: usize,
}

impl AvailabilityRefresh {
    pub fn affected(&self) -> usize {
        self.removed
    }
}

/// Aggregated result of one or more operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuits: Option<CircuitCleanup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogCompaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<RateLimitReset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityRefresh>,
}

impl CompactionReport {
    /// Items removed, summarized, archived or rotated across all operations
    pub fn total_affected(&self) -> usize {
        self.circuits.as_ref().map_or(0, CircuitCleanup::affected)
            + self.logs.as_ref().map_or(0, LogCompaction::affected)
            + self.rate_limits.as_ref().map_or(0, RateLimitReset::affected)
            + self.availability.as_ref().map_or(0, AvailabilityRefresh::affected)
    }
}

/// Remove idle CLOSED circuits, then cap the record count
pub fn cleanup_circuits(
    doc: &mut CircuitStore,
    config: &CompactionConfig,
    now_ms: f64,
) -> CircuitCleanup {
    let max_age_ms = config.circuit_max_age_hours * 3_600_000.0;
    let before = doc.circuits.len();
    doc.circuits.retain(|_, record| {
        !(record.state == CircuitState::Closed && now_ms - record.last_activity_ms() > max_age_ms)
    });
    let expired = before - doc.circuits.len();

    let mut evicted = 0;
    if doc.circuits.len() > config.circuit_max_records {
        let mut by_activity: Vec<(f64, String)> = doc
            .circuits
            .iter()
            .map(|(id, record)| (record.last_activity_ms(), id.clone()))
            .collect();
        by_activity.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let excess = doc.circuits.len() - config.circuit_max_records;
        for (_, id) in by_activity.into_iter().take(excess) {
            doc.circuits.remove(&id);
            evicted += 1;
        }
    }

    CircuitCleanup {
        expired,
        evicted,
        remaining: doc.circuits.len(),
    }
}

/// Drop idle users and prune survivors to the one-hour window
pub fn reset_rate_limits(
    doc: &mut RateLimitStore,
    config: &CompactionConfig,
    now: f64,
) -> RateLimitReset {
    let window = config.rate_limit_reset_window_hours * 3600.0;
    let before = doc.users.len();
    doc.users.retain(|_, record| now - record.last_request <= window);
    let removed = before - doc.users.len();
    let pruned = doc
        .users
        .values_mut()
        .map(|record| record.prune(now))
        .filter(|changed| *changed)
        .count();

    RateLimitReset {
        removed,
        pruned,
        remaining: doc.users.len(),
    }
}

/// Drop availability entries checked longer ago than the age limit
pub fn refresh_availability(
    doc: &mut AvailabilityCache,
    config: &CompactionConfig,
    now: f64,
) -> AvailabilityRefresh {
    let max_age = config.availability_max_age_minutes * 60.0;
    let before = doc.models.len();
    doc.models.retain(|_, entry| now - entry.checked_at <= max_age);
    let removed = before - doc.models.len();
    if removed > 0 {
        doc.last_refresh = now;
    }
    AvailabilityRefresh {
        removed,
        remaining: doc.models.len(),
    }
}

pub struct StateCompactor {
    state: StateConfig,
    config: CompactionConfig,
    circuits: JsonStore<CircuitStore>,
    rate_limits: JsonStore<RateLimitStore>,
    availability: JsonStore<AvailabilityCache>,
    metrics: Arc<Metrics>,
    dry_run: bool,
}

impl StateCompactor {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            state: config.state.clone(),
            config: config.compaction.clone(),
            circuits: JsonStore::new(config.state.circuit_store_path()),
            rate_limits: JsonStore::new(config.state.rate_limit_store_path()),
            availability: JsonStore::new(config.state.availability_cache_path()),
            metrics,
            dry_run: false,
        }
    }

    /// Report what would change without writing anything
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn cleanup_circuits(&self) -> AppResult<CircuitCleanup> {
        self.cleanup_circuits_at(Utc::now())
    }

    pub fn cleanup_circuits_at(&self, now: DateTime<Utc>) -> AppResult<CircuitCleanup> {
        let now_ms = now.timestamp_millis() as f64;
        let report = if self.dry_run {
            cleanup_circuits(&mut self.circuits.load()?, &self.config, now_ms)
        } else {
            self.circuits.transact(|doc| {
                let report = cleanup_circuits(doc, &self.config, now_ms);
                let changed = report.affected() > 0;
                if changed {
                    doc.updated_at = iso_from_ms(now_ms);
                }
                (report, changed)
            })?
        };
        self.finish(Operation::Circuits, report.affected());
        Ok(report)
    }

    pub fn compact_logs(&self) -> AppResult<LogCompaction> {
        self.compact_logs_at(Utc::now())
    }

    pub fn compact_logs_at(&self, now: DateTime<Utc>) -> AppResult<LogCompaction> {
        let log = self.state.decision_log_path();
        let summaries = self.state.summaries_dir();
        let archive = self.state.archive_dir();
        let paths = logs::LogPaths {
            log: &log,
            summaries: &summaries,
            archive: &archive,
        };
        let report = logs::compact(&paths, &self.config, now, self.dry_run)?;
        self.finish(Operation::Logs, report.affected());
        Ok(report)
    }

    pub fn reset_rate_limits(&self) -> AppResult<RateLimitReset> {
        self.reset_rate_limits_at(Utc::now())
    }

    pub fn reset_rate_limits_at(&self, now: DateTime<Utc>) -> AppResult<RateLimitReset> {
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        let report = if self.dry_run {
            reset_rate_limits(&mut self.rate_limits.load()?, &self.config, now_secs)
        } else {
            self.rate_limits.transact(|doc| {
                let report = reset_rate_limits(doc, &self.config, now_secs);
                let changed = report.affected() > 0;
                if changed {
                    doc.updated_at = iso_from_ms(now_secs * 1000.0);
                }
                (report, changed)
            })?
        };
        self.finish(Operation::RateLimits, report.affected());
        Ok(report)
    }

    pub fn refresh_availability(&self) -> AppResult<AvailabilityRefresh> {
        self.refresh_availability_at(Utc::now())
    }

    pub fn refresh_availability_at(&self, now: DateTime<Utc>) -> AppResult<AvailabilityRefresh> {
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        let report = if self.dry_run {
            refresh_availability(&mut self.availability.load()?, &self.config, now_secs)
        } else {
            self.availability.transact(|doc| {
                let report = refresh_availability(doc, &self.config, now_secs);
                let changed = report.affected() > 0;
                (report, changed)
            })?
        };
        self.finish(Operation::Availability, report.affected());
        Ok(report)
    }

    /// Run a single operation
    pub fn run_at(&self, operation: Operation, now: DateTime<Utc>) -> AppResult<CompactionReport> {
        let mut report = CompactionReport {
            dry_run: self.dry_run,
            ..Default::default()
        };
        match operation {
            Operation::Circuits => report.circuits = Some(self.cleanup_circuits_at(now)?),
            Operation::Logs => report.logs = Some(self.compact_logs_at(now)?),
            Operation::RateLimits => report.rate_limits = Some(self.reset_rate_limits_at(now)?),
            Operation::Availability => {
                report.availability = Some(self.refresh_availability_at(now)?)
            }
        }
        Ok(report)
    }

    pub fn run_all(&self) -> AppResult<CompactionReport> {
        self.run_all_at(Utc::now())
    }

    /// Run every operation in fixed order and aggregate the counts
    pub fn run_all_at(&self, now: DateTime<Utc>) -> AppResult<CompactionReport> {
        let report = CompactionReport {
            dry_run: self.dry_run,
            circuits: Some(self.cleanup_circuits_at(now)?),
            logs: Some(self.compact_logs_at(now)?),
            rate_limits: Some(self.reset_rate_limits_at(now)?),
            availability: Some(self.refresh_availability_at(now)?),
        };
        tracing::info!(
            dry_run = self.dry_run,
            total_affected = report.total_affected(),
            "Compaction finished"
        );
        Ok(report)
    }

    /// Daily summary for `date` (`YYYY-MM-DD`), if one was written
    pub fn summary(&self, date: &str) -> AppResult<Option<DailySummary>> {
        logs::read_summary(&self.state.summaries_dir().join(format!("{date}.json")))
    }

    fn finish(&self, operation: Operation, affected: usize) {
        if self.dry_run {
            tracing::info!(operation = operation.as_str(), affected, "Dry run");
            return;
        }
        tracing::info!(operation = operation.as_str(), affected, "Compaction step done");
        if affected > 0 {
            warn_on_error(
                "record_compaction",
                self.metrics
                    .record_compaction(operation.as_str(), affected as u64),
            );
        }
    }
}
