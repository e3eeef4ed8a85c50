//! Decision-log compaction
//!
//! Runs entirely under the decision log's exclusive lock. An oversized log
//! is first rotated into the archive directory whole. The remaining entries
//! are then partitioned by age:
//!
//! ```text
//! age <  log_max_age_days                  keep in the live log
//! age <= log_archive_after_days            fold into summaries/<date>.json
//! older                                    append to archive/<stem>-<YYYY-MM>.jsonl
//! ```
//!
//! Lines that do not parse, or carry no readable timestamp, stay in the live
//! log untouched.

use crate::config::CompactionConfig;
use crate::decision_log::{DecisionTally, RoutingLogEntry};
use crate::error::{AppError, AppResult};
use crate::store::jsonl::{append_raw, read_lines_unlocked};
use crate::store::{with_exclusive, write_atomic};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const DEFAULT_STEM: &str = "routing_decisions";

/// Aggregate of one day's compacted decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    /// `YYYY-MM-DD`
    pub date: String,
    #[serde(flatten)]
    pub tally: DecisionTally,
}

impl DailySummary {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            tally: DecisionTally::default(),
        }
    }
}

/// Counts from one log compaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCompaction {
    pub kept: usize,
    pub summarized: usize,
    pub archived: usize,
    /// Kept because they could not be parsed
    pub unparseable: usize,
    /// File name the oversized log was rotated to
    pub rotated: Option<String>,
    pub summary_dates: Vec<String>,
    pub archive_files: Vec<String>,
}

impl LogCompaction {
    pub fn affected(&self) -> usize {
        self.summarized + self.archived + usize::from(self.rotated.is_some())
    }
}

/// Where log compaction reads and writes
pub(super) struct LogPaths<'a> {
    pub log: &'a Path,
    pub summaries: &'a Path,
    pub archive: &'a Path,
}

pub(super) fn compact(
    paths: &LogPaths<'_>,
    config: &CompactionConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> AppResult<LogCompaction> {
    with_exclusive(paths.log, || compact_locked(paths, config, now, dry_run))
}

fn compact_locked(
    paths: &LogPaths<'_>,
    config: &CompactionConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> AppResult<LogCompaction> {
    let mut report = LogCompaction::default();

    if let Some(rotated) = rotate_if_oversized(paths, config, now, dry_run)? {
        report.rotated = Some(rotated);
        if dry_run {
            // Rotation would move every line out of the live log
            return Ok(report);
        }
    }

    let keep_window = TimeDelta::days(config.log_max_age_days);
    let archive_window = TimeDelta::days(config.log_archive_after_days);

    let mut kept = Vec::new();
    let mut summaries: BTreeMap<String, DecisionTally> = BTreeMap::new();
    let mut archives: BTreeMap<String, String> = BTreeMap::new();
    let stem = log_stem(paths.log);

    for line in read_lines_unlocked(paths.log)? {
        let parsed = serde_json::from_str::<RoutingLogEntry>(&line)
            .ok()
            .and_then(|entry| entry.timestamp_utc().map(|ts| (entry, ts)));
        let Some((entry, timestamp)) = parsed else {
            report.unparseable += 1;
            kept.push(line);
            continue;
        };

        let age = now - timestamp;
        if age < keep_window {
            kept.push(line);
        } else if age <= archive_window {
            summaries
                .entry(timestamp.format("%Y-%m-%d").to_string())
                .or_default()
                .add(&entry);
            report.summarized += 1;
        } else {
            let file = format!("{}-{}.jsonl", stem, timestamp.format("%Y-%m"));
            let buffer = archives.entry(file).or_default();
            buffer.push_str(&line);
            buffer.push('\n');
            report.archived += 1;
        }
    }

    report.kept = kept.len();
    report.summary_dates = summaries.keys().cloned().collect();
    report.archive_files = archives.keys().cloned().collect();
    if dry_run || report.summarized + report.archived == 0 {
        return Ok(report);
    }

    // Summaries and archives land before the live log shrinks, so an
    // interrupted run never loses entries.
    for (date, tally) in &summaries {
        merge_summary(paths.summaries, date, tally)?;
    }
    for (file, text) in &archives {
        append_raw(&paths.archive.join(file), text)?;
    }
    let mut content = kept.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    write_atomic(paths.log, content.as_bytes())?;
    Ok(report)
}

fn log_stem(log: &Path) -> &str {
    log.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_STEM)
}

fn rotate_if_oversized(
    paths: &LogPaths<'_>,
    config: &CompactionConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> AppResult<Option<String>> {
    let size = match std::fs::metadata(paths.log) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AppError::state_io(paths.log, e)),
    };
    let limit = (config.log_max_file_size_mb * 1024.0 * 1024.0) as u64;
    if size <= limit {
        return Ok(None);
    }

    let name = format!(
        "{}-{}.jsonl",
        log_stem(paths.log),
        now.format("%Y%m%dT%H%M%SZ")
    );
    if !dry_run {
        std::fs::create_dir_all(paths.archive)
            .map_err(|e| AppError::state_io(paths.archive, e))?;
        let destination = paths.archive.join(&name);
        std::fs::rename(paths.log, &destination)
            .map_err(|e| AppError::state_io(&destination, e))?;
        tracing::info!(
            size_bytes = size,
            limit_bytes = limit,
            rotated_to = %destination.display(),
            "Rotated oversized decision log"
        );
    }
    Ok(Some(name))
}

/// Fold `tally` into the summary for `date`, creating it if needed
fn merge_summary(dir: &Path, date: &str, tally: &DecisionTally) -> AppResult<()> {
    let path = dir.join(format!("{date}.json"));
    let mut summary = match read_summary(&path)? {
        Some(existing) => existing,
        None => DailySummary::new(date),
    };
    summary.tally.merge(tally);
    let bytes = serde_json::to_vec_pretty(&summary).map_err(|source| AppError::StateEncode {
        path: path.display().to_string(),
        source,
    })?;
    write_atomic(&path, &bytes)
}

/// Load a daily summary; a corrupt file reads as absent
pub(super) fn read_summary(path: &Path) -> AppResult<Option<DailySummary>> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Corrupt daily summary, starting a fresh one"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::state_io(path, e)),
    }
}
