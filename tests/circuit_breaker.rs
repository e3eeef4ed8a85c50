//! Integration tests for the per-backend circuit breaker
//!
//! Exercises the persisted registry end to end (state file, lock, transitions)
//! and checks the state machine invariants with property tests.

use proptest::prelude::*;
use routegate::cli::generate_config_template;
use routegate::config::{CircuitBreakerConfig, Config};
use routegate::metrics::Metrics;
use routegate::models::{CircuitBreakerRegistry, CircuitRecord, CircuitState};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

fn registry(dir: &TempDir) -> CircuitBreakerRegistry {
    let mut config = Config::from_str(generate_config_template()).unwrap();
    config.state.dir = dir.path().to_path_buf();
    CircuitBreakerRegistry::new(&config, Arc::new(Metrics::new().unwrap()))
}

#[test]
fn test_three_failures_open_the_circuit() {
    let dir = TempDir::new().unwrap();
    let circuits = registry(&dir);
    let t0 = 1_700_000_000_000.0;

    assert_eq!(circuits.record_failure_at("o3", t0).unwrap(), CircuitState::Closed);
    assert_eq!(circuits.record_failure_at("o3", t0 + 1.0).unwrap(), CircuitState::Closed);
    assert_eq!(circuits.record_failure_at("o3", t0 + 2.0).unwrap(), CircuitState::Open);

    let admission = circuits.admit_at("o3", t0 + 1_000.0).unwrap();
    assert!(!admission.permitted);
    assert_eq!(admission.state, CircuitState::Open);

    let record = circuits.get("o3").unwrap().unwrap();
    assert_eq!(record.failure_count, 3);
    assert_eq!(record.last_failure_ms, t0 + 2.0);
}

#[test]
fn test_open_circuit_recovers_through_half_open() {
    let dir = TempDir::new().unwrap();
    let circuits = registry(&dir);
    let t0 = 1_700_000_000_000.0;
    for i in 0..3 {
        circuits.record_failure_at("gemini-pro", t0 + i as f64).unwrap();
    }
    let reopen_at = t0 + 2.0 + 300_000.0;

    // One millisecond early is still rejected
    assert!(!circuits.admit_at("gemini-pro", reopen_at - 1.0).unwrap().permitted);

    let probe = circuits.admit_at("gemini-pro", reopen_at).unwrap();
    assert!(probe.permitted);
    assert_eq!(probe.state, CircuitState::HalfOpen);

    // Default cap admits one more half-open call, then rejects
    assert!(circuits.admit_at("gemini-pro", reopen_at + 1.0).unwrap().permitted);
    assert!(!circuits.admit_at("gemini-pro", reopen_at + 2.0).unwrap().permitted);

    assert_eq!(
        circuits.record_success_at("gemini-pro", reopen_at + 3.0).unwrap(),
        CircuitState::Closed
    );
    let record = circuits.get("gemini-pro").unwrap().unwrap();
    assert_eq!(record.failure_count, 0);
    assert_eq!(record.half_open_calls, 0);
    assert!(circuits.admit_at("gemini-pro", reopen_at + 4.0).unwrap().permitted);
}

#[test]
fn test_exhausted_half_open_waits_for_an_outcome() {
    let dir = TempDir::new().unwrap();
    let circuits = registry(&dir);
    let t0 = 1_700_000_000_000.0;
    for i in 0..3 {
        circuits.record_failure_at("o3", t0 + i as f64).unwrap();
    }
    let reopen_at = t0 + 2.0 + 300_000.0;
    assert!(circuits.admit_at("o3", reopen_at).unwrap().permitted);
    assert!(circuits.admit_at("o3", reopen_at + 1.0).unwrap().permitted);

    // No success or failure is recorded: the circuit keeps rejecting, even
    // long after another reset timeout would have elapsed
    let much_later = reopen_at + 10.0 * 300_000.0;
    let admission = circuits.admit_at("o3", much_later).unwrap();
    assert!(!admission.permitted);
    assert_eq!(admission.state, CircuitState::HalfOpen);

    circuits.record_failure_at("o3", much_later + 1.0).unwrap();
    assert_eq!(circuits.get("o3").unwrap().unwrap().state, CircuitState::Open);
}

#[test]
fn test_half_open_failure_reopens_immediately() {
    let dir = TempDir::new().unwrap();
    let circuits = registry(&dir);
    let t0 = 1_700_000_000_000.0;
    for i in 0..3 {
        circuits.record_failure_at("claude-opus", t0 + i as f64).unwrap();
    }
    let later = t0 + 400_000.0;
    assert!(circuits.admit_at("claude-opus", later).unwrap().permitted);
    assert_eq!(
        circuits.record_failure_at("claude-opus", later + 1.0).unwrap(),
        CircuitState::Open
    );
    assert!(!circuits.admit_at("claude-opus", later + 2.0).unwrap().permitted);
}

#[test]
fn test_peek_never_mutates() {
    let dir = TempDir::new().unwrap();
    let circuits = registry(&dir);
    let t0 = 1_700_000_000_000.0;
    for i in 0..3 {
        circuits.record_failure_at("o3", t0 + i as f64).unwrap();
    }
    let before = circuits.snapshot().unwrap();
    assert!(circuits.peek_at("o3", t0 + 400_000.0).unwrap());
    assert!(circuits.peek_at("never-seen", t0).unwrap());
    assert_eq!(circuits.snapshot().unwrap(), before);
}

#[test]
fn test_state_is_shared_between_registries() {
    let dir = TempDir::new().unwrap();
    let first = registry(&dir);
    let second = registry(&dir);
    let t0 = 1_700_000_000_000.0;

    first.record_failure_at("o3", t0).unwrap();
    second.record_failure_at("o3", t0 + 1.0).unwrap();
    first.record_failure_at("o3", t0 + 2.0).unwrap();

    assert_eq!(second.get("o3").unwrap().unwrap().state, CircuitState::Open);
}

#[test]
fn test_store_file_uses_wire_names() {
    let dir = TempDir::new().unwrap();
    let circuits = registry(&dir);
    for i in 0..3 {
        circuits.record_failure_at("o3", 1_000.0 + i as f64).unwrap();
    }
    let raw = std::fs::read_to_string(dir.path().join("circuit_breakers.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["version"], 1);
    assert!(json["updatedAt"].is_string());
    assert_eq!(json["circuits"]["o3"]["state"], "OPEN");
    assert_eq!(json["circuits"]["o3"]["failureCount"], 3);
    assert_eq!(json["circuits"]["o3"]["lastFailureMs"], 1_002.0);
}

#[test]
fn test_concurrent_failures_are_all_counted() {
    let dir = TempDir::new().unwrap();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let circuits = registry(&dir);
            std::thread::spawn(move || {
                for j in 0..5 {
                    circuits
                        .record_failure_at("claude-sonnet", (i * 10 + j) as f64)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let record = registry(&dir).get("claude-sonnet").unwrap().unwrap();
    assert_eq!(record.failure_count, 40);
    assert_eq!(record.state, CircuitState::Open);
}

#[test]
fn test_concurrent_half_open_admissions_respect_cap() {
    let dir = TempDir::new().unwrap();
    let t0 = 1_700_000_000_000.0;
    {
        let circuits = registry(&dir);
        for i in 0..3 {
            circuits.record_failure_at("o3", t0 + i as f64).unwrap();
        }
        // Move to HALF_OPEN so every thread competes for the single slot
        assert!(circuits.admit_at("o3", t0 + 400_000.0).unwrap().permitted);
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let circuits = registry(&dir);
            std::thread::spawn(move || circuits.admit_at("o3", t0 + 400_001.0).unwrap().permitted)
        })
        .collect();
    let permitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|p| *p)
        .count();
    assert_eq!(permitted, 1);
}

fn breaker(failure_threshold: u32, half_open_max_calls: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout_ms: 300_000,
        half_open_max_calls,
    }
}

proptest! {
    #[test]
    fn prop_opens_exactly_at_threshold(threshold in 1u32..8, failures in 0u32..16) {
        let config = breaker(threshold, 1);
        let mut record = CircuitRecord::new("b");
        for i in 0..failures {
            record.on_failure(&config, i as f64);
        }
        let expected = if failures >= threshold { CircuitState::Open } else { CircuitState::Closed };
        prop_assert_eq!(record.state, expected);
    }

    #[test]
    fn prop_half_open_admits_at_most_cap(cap in 1u32..5, attempts in 0usize..12) {
        let config = breaker(1, cap);
        let mut record = CircuitRecord::new("b");
        record.on_failure(&config, 0.0);
        let (permitted, transition) = record.admit(&config, 300_000.0);
        prop_assert!(permitted);
        prop_assert_eq!(transition, Some(CircuitState::HalfOpen));

        let admitted = (0..attempts)
            .filter(|i| record.admit(&config, 300_001.0 + *i as f64).0)
            .count();
        prop_assert_eq!(admitted, attempts.min(cap as usize));
        prop_assert_eq!(record.state, CircuitState::HalfOpen);
    }

    #[test]
    fn prop_open_rejects_until_reset_timeout(elapsed in 0u64..600_000) {
        let config = breaker(1, 1);
        let mut record = CircuitRecord::new("b");
        record.on_failure(&config, 1_000.0);
        let (permitted, _) = record.admit(&config, 1_000.0 + elapsed as f64);
        prop_assert_eq!(permitted, elapsed >= config.reset_timeout_ms);
    }

    #[test]
    fn prop_success_resets_failure_count(failures in 0u32..3) {
        let config = breaker(3, 1);
        let mut record = CircuitRecord::new("b");
        for i in 0..failures {
            record.on_failure(&config, i as f64);
        }
        record.on_success(100.0);
        prop_assert_eq!(record.failure_count, 0);
        prop_assert_eq!(record.state, CircuitState::Closed);
    }
}
