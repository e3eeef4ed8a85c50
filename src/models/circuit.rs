//! Circuit breaker for backend models
//!
//! Per-backend health state machine persisted in the shared circuit store.
//!
//! ```text
//! CLOSED ──failures >= threshold──▶ OPEN
//! OPEN ──reset timeout elapsed, on admit──▶ HALF_OPEN
//! HALF_OPEN ──success──▶ CLOSED
//! HALF_OPEN ──failure──▶ OPEN
//! ```
//!
//! `admit` is the permission check and it mutates state: it may move an
//! OPEN record to HALF_OPEN and it counts half-open admissions. Every
//! mutation happens under the store's exclusive file lock, so two processes
//! cannot both take the last half-open slot. `peek` answers the same
//! question without mutating anything.
//!
//! Half-open admissions are only released by a recorded outcome. A caller
//! that is admitted and never reports back leaves the record rejecting until
//! a success or failure is recorded for it.

use crate::config::{CircuitBreakerConfig, Config};
use crate::error::AppResult;
use crate::metrics::{Metrics, warn_on_error};
use crate::store::{JsonStore, iso_now};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Circuit state for one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Metrics/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Persisted circuit for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub model: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_ms: f64,
    pub last_success_ms: f64,
    pub half_open_calls: u32,
}

impl CircuitRecord {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_ms: 0.0,
            last_success_ms: 0.0,
            half_open_calls: 0,
        }
    }

    /// Most recent recorded outcome, in epoch millis (0 if none)
    pub fn last_activity_ms(&self) -> f64 {
        self.last_failure_ms.max(self.last_success_ms)
    }

    fn reset_elapsed(&self, config: &CircuitBreakerConfig, now_ms: f64) -> bool {
        now_ms - self.last_failure_ms >= config.reset_timeout_ms as f64
    }

    /// Whether `admit` would permit a call right now, without mutating
    pub fn would_admit(&self, config: &CircuitBreakerConfig, now_ms: f64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.reset_elapsed(config, now_ms),
            CircuitState::HalfOpen => self.half_open_calls < config.half_open_max_calls,
        }
    }

    /// Permission check; returns whether the call is permitted and any transition
    pub fn admit(
        &mut self,
        config: &CircuitBreakerConfig,
        now_ms: f64,
    ) -> (bool, Option<CircuitState>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if self.reset_elapsed(config, now_ms) {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 0;
                    (true, Some(CircuitState::HalfOpen))
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < config.half_open_max_calls {
                    self.half_open_calls += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    /// Apply a successful call; returns the transition, if any
    pub fn on_success(&mut self, now_ms: f64) -> Option<CircuitState> {
        self.last_success_ms = now_ms;
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.half_open_calls = 0;
                Some(CircuitState::Closed)
            }
            // A late success from a call admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    /// Apply a failed call; returns the transition, if any
    pub fn on_failure(
        &mut self,
        config: &CircuitBreakerConfig,
        now_ms: f64,
    ) -> Option<CircuitState> {
        self.last_failure_ms = now_ms;
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= config.failure_threshold {
                    self.state = CircuitState::Open;
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }
}

/// On-disk circuit store document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStore {
    pub version: u32,
    pub updated_at: String,
    pub circuits: BTreeMap<String, CircuitRecord>,
}

impl Default for CircuitStore {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: String::new(),
            circuits: BTreeMap::new(),
        }
    }
}

/// Result of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub permitted: bool,
    /// State after the check
    pub state: CircuitState,
}

/// Current wall-clock time in epoch millis
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Registry of per-backend circuits
///
/// The registry is the only writer of circuit records.
pub struct CircuitBreakerRegistry {
    store: JsonStore<CircuitStore>,
    config: CircuitBreakerConfig,
    metrics: Arc<Metrics>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            store: JsonStore::new(config.state.circuit_store_path()),
            config: config.circuit_breaker.clone(),
            metrics,
        }
    }

    pub fn store(&self) -> &JsonStore<CircuitStore> {
        &self.store
    }

    /// Effectful permission check (see module docs)
    pub fn admit(&self, backend: &str) -> AppResult<Admission> {
        self.admit_at(backend, now_ms())
    }

    pub fn admit_at(&self, backend: &str, now_ms: f64) -> AppResult<Admission> {
        let config = &self.config;
        let (admission, transition) = self.store.transact(|doc| {
            let mut created = false;
            let record = doc.circuits.entry(backend.to_string()).or_insert_with(|| {
                created = true;
                CircuitRecord::new(backend)
            });
            let before = (record.state, record.half_open_calls);
            let (permitted, transition) = record.admit(config, now_ms);
            let changed = created || before != (record.state, record.half_open_calls);
            let admission = Admission {
                permitted,
                state: record.state,
            };
            if changed {
                doc.updated_at = iso_now();
            }
            ((admission, transition), changed)
        })?;

        if let Some(to) = transition {
            self.log_transition(backend, to);
        }
        if !admission.permitted {
            tracing::debug!(
                backend,
                state = admission.state.as_str(),
                "Circuit rejected call"
            );
        }
        Ok(admission)
    }

    /// Whether `admit` would currently permit a call; never mutates
    pub fn peek(&self, backend: &str) -> AppResult<bool> {
        self.peek_at(backend, now_ms())
    }

    pub fn peek_at(&self, backend: &str, now_ms: f64) -> AppResult<bool> {
        let doc = self.store.load()?;
        Ok(doc
            .circuits
            .get(backend)
            .is_none_or(|r| r.would_admit(&self.config, now_ms)))
    }

    /// Subset of `backends` that `admit` would currently permit; one read
    pub fn admissible_at<'a, I>(&self, backends: I, now_ms: f64) -> AppResult<HashSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let doc = self.store.load()?;
        Ok(backends
            .into_iter()
            .filter(|b| {
                doc.circuits
                    .get(*b)
                    .is_none_or(|r| r.would_admit(&self.config, now_ms))
            })
            .map(str::to_string)
            .collect())
    }

    pub fn record_success(&self, backend: &str) -> AppResult<CircuitState> {
        self.record_success_at(backend, now_ms())
    }

    pub fn record_success_at(&self, backend: &str, now_ms: f64) -> AppResult<CircuitState> {
        let (state, transition) = self.store.update(|doc| {
            doc.updated_at = iso_now();
            let record = doc
                .circuits
                .entry(backend.to_string())
                .or_insert_with(|| CircuitRecord::new(backend));
            let transition = record.on_success(now_ms);
            (record.state, transition)
        })?;

        match transition {
            Some(to) => self.log_transition(backend, to),
            None => tracing::debug!(backend, state = state.as_str(), "Success recorded"),
        }
        Ok(state)
    }

    pub fn record_failure(&self, backend: &str) -> AppResult<CircuitState> {
        self.record_failure_at(backend, now_ms())
    }

    pub fn record_failure_at(&self, backend: &str, now_ms: f64) -> AppResult<CircuitState> {
        let config = &self.config;
        let (state, failures, transition) = self.store.update(|doc| {
            doc.updated_at = iso_now();
            let record = doc
                .circuits
                .entry(backend.to_string())
                .or_insert_with(|| CircuitRecord::new(backend));
            let transition = record.on_failure(config, now_ms);
            (record.state, record.failure_count, transition)
        })?;

        match transition {
            Some(to) => self.log_transition(backend, to),
            None => tracing::debug!(
                backend,
                state = state.as_str(),
                failure_count = failures,
                "Failure recorded"
            ),
        }
        Ok(state)
    }

    /// Read-only view of every circuit, for dashboards
    pub fn snapshot(&self) -> AppResult<BTreeMap<String, CircuitRecord>> {
        Ok(self.store.load()?.circuits)
    }

    pub fn get(&self, backend: &str) -> AppResult<Option<CircuitRecord>> {
        Ok(self.store.load()?.circuits.remove(backend))
    }

    fn log_transition(&self, backend: &str, to: CircuitState) {
        match to {
            CircuitState::Open => tracing::warn!(
                backend,
                failure_threshold = self.config.failure_threshold,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(backend, "Circuit half-open, admitting probe calls")
            }
            CircuitState::Closed => tracing::info!(backend, "Circuit closed, backend recovered"),
        }
        warn_on_error(
            "record_circuit_transition",
            self.metrics.record_circuit_transition(to.as_str()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn breaker_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 300_000,
            half_open_max_calls: 1,
        }
    }

    fn registry(dir: &std::path::Path) -> CircuitBreakerRegistry {
        let mut config = Config::from_str(
            r#"
[routing_rules]
large_context_backend = "backend-x"

[[backends]]
id = "backend-x"
name = "Backend X"
"#,
        )
        .unwrap();
        config.state.dir = dir.to_path_buf();
        CircuitBreakerRegistry::new(&config, Arc::new(Metrics::new().unwrap()))
    }

    #[test]
    fn test_record_opens_at_threshold_not_before() {
        let cfg = breaker_config();
        let mut record = CircuitRecord::new("backend-x");
        assert_eq!(record.on_failure(&cfg, 1.0), None);
        assert_eq!(record.on_failure(&cfg, 2.0), None);
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.on_failure(&cfg, 3.0), Some(CircuitState::Open));
        assert_eq!(record.failure_count, 3);
        assert_eq!(record.last_failure_ms, 3.0);
    }

    #[test]
    fn test_success_resets_failure_count_in_closed() {
        let cfg = breaker_config();
        let mut record = CircuitRecord::new("backend-x");
        record.on_failure(&cfg, 1.0);
        record.on_failure(&cfg, 2.0);
        record.on_success(3.0);
        assert_eq!(record.failure_count, 0);
        record.on_failure(&cfg, 4.0);
        record.on_failure(&cfg, 5.0);
        assert_eq!(record.state, CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_until_reset_timeout() {
        let cfg = breaker_config();
        let mut record = CircuitRecord::new("backend-x");
        for t in 0..3 {
            record.on_failure(&cfg, 1_000.0 + t as f64);
        }
        let opened_at = record.last_failure_ms;

        assert_eq!(record.admit(&cfg, opened_at + 299_999.0), (false, None));
        assert_eq!(record.state, CircuitState::Open);

        assert_eq!(
            record.admit(&cfg, opened_at + 300_000.0),
            (true, Some(CircuitState::HalfOpen))
        );
        assert_eq!(record.half_open_calls, 0);
    }

    #[test]
    fn test_half_open_admits_up_to_cap() {
        let cfg = CircuitBreakerConfig {
            half_open_max_calls: 2,
            ..breaker_config()
        };
        let mut record = CircuitRecord::new("backend-x");
        record.state = CircuitState::HalfOpen;

        assert_eq!(record.admit(&cfg, 0.0), (true, None));
        assert_eq!(record.admit(&cfg, 0.0), (true, None));
        assert_eq!(record.admit(&cfg, 0.0), (false, None));
        assert_eq!(record.half_open_calls, 2);
        assert!(!record.would_admit(&cfg, 0.0));
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let cfg = breaker_config();
        let mut record = CircuitRecord::new("backend-x");
        record.state = CircuitState::HalfOpen;
        assert_eq!(record.on_failure(&cfg, 10.0), Some(CircuitState::Open));
        assert_eq!(record.state, CircuitState::Open);
    }

    #[test]
    fn test_half_open_success_closes_and_resets() {
        let mut record = CircuitRecord::new("backend-x");
        record.state = CircuitState::HalfOpen;
        record.failure_count = 4;
        record.half_open_calls = 1;
        assert_eq!(record.on_success(10.0), Some(CircuitState::Closed));
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.half_open_calls, 0);
    }

    #[test]
    fn test_success_while_open_keeps_failures() {
        let mut record = CircuitRecord::new("backend-x");
        record.state = CircuitState::Open;
        record.failure_count = 3;
        assert_eq!(record.on_success(10.0), None);
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.failure_count, 3);
        assert_eq!(record.last_success_ms, 10.0);
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            r#""HALF_OPEN""#
        );
        assert_eq!(
            serde_json::from_str::<CircuitState>(r#""CLOSED""#).unwrap(),
            CircuitState::Closed
        );
    }

    #[test]
    fn test_registry_three_failures_open_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert_eq!(
            registry.record_failure_at("backend-x", 1.0).unwrap(),
            CircuitState::Closed
        );
        assert_eq!(
            registry.record_failure_at("backend-x", 2.0).unwrap(),
            CircuitState::Closed
        );
        assert_eq!(
            registry.record_failure_at("backend-x", 3.0).unwrap(),
            CircuitState::Open
        );
        assert!(!registry.admit_at("backend-x", 4.0).unwrap().permitted);
    }

    #[test]
    fn test_registry_admit_creates_record_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(registry.get("backend-x").unwrap().is_none());

        let admission = registry.admit_at("backend-x", 5.0).unwrap();
        assert_eq!(
            admission,
            Admission {
                permitted: true,
                state: CircuitState::Closed
            }
        );
        assert_eq!(
            registry.get("backend-x").unwrap(),
            Some(CircuitRecord::new("backend-x"))
        );
    }

    #[test]
    fn test_registry_peek_does_not_transition() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        for t in 0..3 {
            registry.record_failure_at("backend-x", t as f64).unwrap();
        }
        let later = 2.0 + 300_000.0;
        assert!(registry.peek_at("backend-x", later).unwrap());
        assert_eq!(
            registry.get("backend-x").unwrap().unwrap().state,
            CircuitState::Open
        );

        let admission = registry.admit_at("backend-x", later).unwrap();
        assert!(admission.permitted);
        assert_eq!(admission.state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_registry_admissible_filters_open_backends() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        for t in 0..3 {
            registry.record_failure_at("backend-x", t as f64).unwrap();
        }
        let allowed = registry
            .admissible_at(["backend-x", "backend-y"], 10.0)
            .unwrap();
        assert!(allowed.contains("backend-y"));
        assert!(!allowed.contains("backend-x"));
    }

    #[test]
    fn test_store_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.record_failure_at("backend-x", 1_700_000_000_123.5).unwrap();
        registry.record_success_at("backend-y", 1_700_000_000_456.25).unwrap();

        let first = registry.store().load().unwrap();
        let text = serde_json::to_string(&first).unwrap();
        let reparsed: CircuitStore = serde_json::from_str(&text).unwrap();
        assert_eq!(first, reparsed);
        assert_eq!(registry.store().load().unwrap(), first);
    }

    #[test]
    fn test_persisted_schema_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.record_failure_at("backend-x", 42.0).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("circuit_breakers.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["updatedAt"].is_string());
        let record = &value["circuits"]["backend-x"];
        assert_eq!(record["model"], "backend-x");
        assert_eq!(record["state"], "CLOSED");
        assert_eq!(record["failureCount"], 1);
        assert_eq!(record["lastFailureMs"], 42.0);
        assert_eq!(record["halfOpenCalls"], 0);
    }
}
