//! Per-user sliding-window rate limiting
//!
//! Each user keeps the timestamps of accepted requests from the last hour,
//! plus a separate list for premium backends. Checks run in a fixed order:
//! per-minute, per-hour, then premium, and only a premium backend consumes
//! premium quota. Rejections are normal return values, never errors.

use crate::config::{Config, RateLimitConfig};
use crate::error::AppResult;
use crate::metrics::{Limit, Metrics, warn_on_error};
use crate::models::availability::now_secs;
use crate::store::{JsonStore, iso_now};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sliding window kept on every record
pub const WINDOW_SECS: f64 = 3600.0;
const MINUTE_SECS: f64 = 60.0;

/// Persisted request history for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub user_id: String,
    /// Epoch seconds of accepted requests
    pub requests: Vec<f64>,
    /// Epoch seconds of accepted premium requests
    pub premium_requests: Vec<f64>,
    pub last_request: f64,
    /// Total rejections; never reset
    pub violations: u64,
}

impl RateLimitRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            requests: Vec::new(),
            premium_requests: Vec::new(),
            last_request: 0.0,
            violations: 0,
        }
    }

    /// Drop timestamps outside the one-hour window; returns whether anything changed
    pub fn prune(&mut self, now: f64) -> bool {
        let before = (self.requests.len(), self.premium_requests.len());
        self.requests.retain(|t| now - t < WINDOW_SECS);
        self.premium_requests.retain(|t| now - t < WINDOW_SECS);
        before != (self.requests.len(), self.premium_requests.len())
    }

    /// Apply one request against `limits`
    pub fn check(
        &mut self,
        limits: &RateLimitConfig,
        backend: &str,
        premium: bool,
        now: f64,
    ) -> RateLimitVerdict {
        self.prune(now);

        let recent_minute = self
            .requests
            .iter()
            .filter(|t| now - *t < MINUTE_SECS)
            .count();
        if recent_minute >= limits.requests_per_minute {
            self.violations += 1;
            return RateLimitVerdict::rejected(
                Limit::PerMinute,
                format!(
                    "Rate limit exceeded: {} requests/minute",
                    limits.requests_per_minute
                ),
            );
        }

        if self.requests.len() >= limits.requests_per_hour {
            self.violations += 1;
            return RateLimitVerdict::rejected(
                Limit::PerHour,
                format!(
                    "Rate limit exceeded: {} requests/hour",
                    limits.requests_per_hour
                ),
            );
        }

        if premium && self.premium_requests.len() >= limits.premium_per_hour {
            self.violations += 1;
            return RateLimitVerdict::rejected(
                Limit::Premium,
                format!(
                    "Premium rate limit exceeded: {} premium requests/hour ({})",
                    limits.premium_per_hour, backend
                ),
            );
        }

        self.requests.push(now);
        if premium {
            self.premium_requests.push(now);
        }
        self.last_request = now;
        RateLimitVerdict::allowed()
    }

    /// Request counts inside the current windows
    pub fn usage(&self, now: f64) -> Usage {
        let in_window = |t: &&f64| now - **t < WINDOW_SECS;
        Usage {
            last_minute: self
                .requests
                .iter()
                .filter(|t| now - **t < MINUTE_SECS)
                .count(),
            last_hour: self.requests.iter().filter(in_window).count(),
            premium_last_hour: self.premium_requests.iter().filter(in_window).count(),
            violations: self.violations,
        }
    }
}

/// On-disk rate-limit store document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStore {
    pub version: u32,
    pub updated_at: String,
    pub users: BTreeMap<String, RateLimitRecord>,
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: String::new(),
            users: BTreeMap::new(),
        }
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub reason: String,
    /// Which limit rejected the request
    pub limit: Option<Limit>,
}

impl RateLimitVerdict {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: "ok".to_string(),
            limit: None,
        }
    }

    fn rejected(limit: Limit, reason: String) -> Self {
        Self {
            allowed: false,
            reason,
            limit: Some(limit),
        }
    }
}

/// Current usage for dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub last_minute: usize,
    pub last_hour: usize,
    pub premium_last_hour: usize,
    pub violations: u64,
}

pub struct RateLimiter {
    store: JsonStore<RateLimitStore>,
    limits: RateLimitConfig,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            store: JsonStore::new(config.state.rate_limit_store_path()),
            limits: config.rate_limits.clone(),
            metrics,
        }
    }

    pub fn store(&self) -> &JsonStore<RateLimitStore> {
        &self.store
    }

    pub fn check_rate_limit(&self, user: &str, backend: &str) -> AppResult<RateLimitVerdict> {
        self.check_rate_limit_at(user, backend, now_secs())
    }

    pub fn check_rate_limit_at(
        &self,
        user: &str,
        backend: &str,
        now: f64,
    ) -> AppResult<RateLimitVerdict> {
        let premium = self.limits.is_premium(backend);
        let limits = &self.limits;
        let (verdict, violations) = self.store.update(|doc| {
            doc.updated_at = iso_now();
            let record = doc
                .users
                .entry(user.to_string())
                .or_insert_with(|| RateLimitRecord::new(user));
            let verdict = record.check(limits, backend, premium, now);
            (verdict, record.violations)
        })?;

        if let Some(limit) = verdict.limit {
            tracing::warn!(
                user,
                backend,
                limit = limit.as_str(),
                violations,
                "Rate limit rejected request"
            );
            warn_on_error(
                "record_rate_limit_rejection",
                self.metrics.record_rate_limit_rejection(limit),
            );
        }
        Ok(verdict)
    }

    pub fn usage(&self, user: &str) -> AppResult<Option<Usage>> {
        self.usage_at(user, now_secs())
    }

    pub fn usage_at(&self, user: &str, now: f64) -> AppResult<Option<Usage>> {
        Ok(self.store.load()?.users.get(user).map(|r| r.usage(now)))
    }

    /// Read-only view of every user's record, for dashboards
    pub fn snapshot(&self) -> AppResult<BTreeMap<String, RateLimitRecord>> {
        Ok(self.store.load()?.users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: 20,
            requests_per_hour: 200,
            premium_per_hour: 2,
            premium_backends: vec!["claude-opus".to_string()],
        }
    }

    #[test]
    fn test_twenty_first_call_in_ten_seconds_rejected() {
        let limits = limits();
        let mut record = RateLimitRecord::new("alice");
        for i in 0..20 {
            let verdict = record.check(&limits, "claude-sonnet", false, 1000.0 + i as f64 * 0.5);
            assert!(verdict.allowed, "call {} should pass", i + 1);
        }
        let verdict = record.check(&limits, "claude-sonnet", false, 1010.0);
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("20 requests/minute"));
        assert_eq!(verdict.limit, Some(Limit::PerMinute));
        assert_eq!(record.violations, 1);
        assert_eq!(record.requests.len(), 20);
    }

    #[test]
    fn test_minute_window_slides() {
        let limits = limits();
        let mut record = RateLimitRecord::new("alice");
        for i in 0..20 {
            assert!(record.check(&limits, "x", false, 1000.0 + i as f64).allowed);
        }
        // First request is now 60s old
        assert!(record.check(&limits, "x", false, 1060.0).allowed);
    }

    #[test]
    fn test_hour_limit() {
        let limits = RateLimitConfig {
            requests_per_minute: 1000,
            requests_per_hour: 5,
            ..limits()
        };
        let mut record = RateLimitRecord::new("bob");
        for i in 0..5 {
            assert!(record.check(&limits, "x", false, i as f64 * 100.0).allowed);
        }
        let verdict = record.check(&limits, "x", false, 600.0);
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("5 requests/hour"));
    }

    #[test]
    fn test_premium_quota_only_for_premium_backends() {
        let limits = limits();
        let mut record = RateLimitRecord::new("carol");
        assert!(record.check(&limits, "claude-opus", true, 0.0).allowed);
        assert!(record.check(&limits, "claude-opus", true, 1.0).allowed);

        let verdict = record.check(&limits, "claude-opus", true, 2.0);
        assert!(!verdict.allowed);
        assert_eq!(verdict.limit, Some(Limit::Premium));
        // Rejected premium requests are not recorded
        assert_eq!(record.requests.len(), 2);
        assert_eq!(record.premium_requests.len(), 2);

        // Non-premium traffic is unaffected by the exhausted premium quota
        assert!(record.check(&limits, "claude-sonnet", false, 3.0).allowed);
        assert_eq!(record.premium_requests.len(), 2);
    }

    #[test]
    fn test_prune_drops_entries_older_than_an_hour() {
        let mut record = RateLimitRecord::new("dave");
        record.requests = vec![0.0, 100.0, 3000.0];
        record.premium_requests = vec![50.0];
        assert!(record.prune(3750.0));
        assert_eq!(record.requests, vec![3000.0]);
        assert!(record.premium_requests.is_empty());
        assert!(!record.prune(3750.0));
    }

    #[test]
    fn test_prune_window_boundary_is_exclusive() {
        let mut record = RateLimitRecord::new("erin");
        record.requests = vec![150.0, 151.0];
        record.premium_requests = vec![150.0];
        // Exactly one hour old falls out; one second younger stays
        assert!(record.prune(3750.0));
        assert_eq!(record.requests, vec![151.0]);
        assert!(record.premium_requests.is_empty());
    }

    #[test]
    fn test_limiter_persists_and_reports_usage() {
        use std::str::FromStr;
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_str(
            r#"
[rate_limits]
premium_backends = ["claude-opus"]

[routing_rules]
large_context_backend = "claude-opus"

[[backends]]
id = "claude-opus"
name = "Claude Opus"
"#,
        )
        .unwrap();
        config.state.dir = dir.path().to_path_buf();
        let limiter = RateLimiter::new(&config, Arc::new(Metrics::new().unwrap()));

        assert!(
            limiter
                .check_rate_limit_at("erin", "claude-opus", 500.0)
                .unwrap()
                .allowed
        );
        let usage = limiter.usage_at("erin", 510.0).unwrap().unwrap();
        assert_eq!(usage.last_minute, 1);
        assert_eq!(usage.premium_last_hour, 1);

        let snapshot = limiter.snapshot().unwrap();
        assert_eq!(snapshot["erin"].last_request, 500.0);
        assert_eq!(snapshot["erin"].user_id, "erin");
    }
}
