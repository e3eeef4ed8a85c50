//! Persisted stores reload exactly what was saved, and corrupt files recover
//! to the empty document.

use proptest::prelude::*;
use routegate::models::{CircuitRecord, CircuitState, CircuitStore};
use routegate::rate_limit::{RateLimitRecord, RateLimitStore};
use routegate::store::JsonStore;
use tempfile::TempDir;

fn circuit_state() -> impl Strategy<Value = CircuitState> {
    prop_oneof![
        Just(CircuitState::Closed),
        Just(CircuitState::Open),
        Just(CircuitState::HalfOpen),
    ]
}

prop_compose! {
    fn circuit_record()(
        model in "[a-z][a-z0-9-]{0,12}",
        state in circuit_state(),
        failure_count in 0u32..50,
        last_failure in 0u64..2_000_000_000_000,
        last_success in 0u64..2_000_000_000_000,
        half_open_calls in 0u32..4,
    ) -> CircuitRecord {
        CircuitRecord {
            model,
            state,
            failure_count,
            last_failure_ms: last_failure as f64,
            last_success_ms: last_success as f64,
            half_open_calls,
        }
    }
}

prop_compose! {
    fn rate_limit_record()(
        user_id in "[a-z]{1,8}",
        requests in proptest::collection::vec(0u32..2_000_000_000, 0..30),
        premium in proptest::collection::vec(0u32..2_000_000_000, 0..10),
        last_request in 0u32..2_000_000_000,
        violations in 0u64..1_000,
    ) -> RateLimitRecord {
        RateLimitRecord {
            user_id,
            requests: requests.into_iter().map(f64::from).collect(),
            premium_requests: premium.into_iter().map(f64::from).collect(),
            last_request: f64::from(last_request),
            violations,
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_circuit_store_round_trips(records in proptest::collection::vec(circuit_record(), 0..8)) {
        let dir = TempDir::new().unwrap();
        let store: JsonStore<CircuitStore> = JsonStore::new(dir.path().join("circuit_breakers.json"));

        let mut doc = CircuitStore::default();
        doc.updated_at = "2026-01-01T00:00:00.000Z".to_string();
        for record in records {
            doc.circuits.insert(record.model.clone(), record);
        }
        let saved = doc.clone();
        store.update(move |current| *current = doc).unwrap();

        prop_assert_eq!(store.load().unwrap(), saved);
    }

    #[test]
    fn prop_rate_limit_store_round_trips(records in proptest::collection::vec(rate_limit_record(), 0..8)) {
        let dir = TempDir::new().unwrap();
        let store: JsonStore<RateLimitStore> = JsonStore::new(dir.path().join("rate_limits.json"));

        let mut doc = RateLimitStore::default();
        for record in records {
            doc.users.insert(record.user_id.clone(), record);
        }
        let saved = doc.clone();
        store.update(move |current| *current = doc).unwrap();

        prop_assert_eq!(store.load().unwrap(), saved);
    }
}

#[test]
fn test_corrupt_store_reads_as_default_and_is_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("circuit_breakers.json");
    std::fs::write(&path, "{\"version\": 1, \"circuits\": {").unwrap();
    let store: JsonStore<CircuitStore> = JsonStore::new(&path);

    assert_eq!(store.load().unwrap(), CircuitStore::default());

    store
        .update(|doc| {
            doc.circuits
                .insert("o3".to_string(), CircuitRecord::new("o3"));
        })
        .unwrap();
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.circuits.len(), 1);
    assert_eq!(reloaded.circuits["o3"].state, CircuitState::Closed);
}

#[test]
fn test_missing_and_empty_files_read_as_default() {
    let dir = TempDir::new().unwrap();
    let missing: JsonStore<RateLimitStore> = JsonStore::new(dir.path().join("nope.json"));
    assert_eq!(missing.load().unwrap(), RateLimitStore::default());

    let empty_path = dir.path().join("empty.json");
    std::fs::write(&empty_path, "  \n").unwrap();
    let empty: JsonStore<RateLimitStore> = JsonStore::new(&empty_path);
    assert_eq!(empty.load().unwrap(), RateLimitStore::default());
}
