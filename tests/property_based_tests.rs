use chrono::Utc;
use outbox_sync::config::RetryConfig;
use outbox_sync::enqueue::{idempotency_key, prepare_items, EnqueueItem};
use outbox_sync::error::RemoteError;
use outbox_sync::retry::{BackoffPolicy, DispatchFailure, FailureContext, RetryController};
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

fn policy(base: u64, multiplier: f64, cap: u64, jitter: f64) -> BackoffPolicy {
    BackoffPolicy::from_config(&RetryConfig {
        base_backoff_seconds: base,
        backoff_multiplier: multiplier,
        max_backoff_seconds: cap,
        jitter_factor: jitter,
        ..RetryConfig::default()
    })
}

fn context(attempt: u32) -> FailureContext {
    FailureContext {
        item_id: 1,
        correlation_id: "c".to_string(),
        table: "proposal".to_string(),
        record_id: "p-1".to_string(),
        sequence: 1,
        attempt,
        notes: Vec::new(),
    }
}

fn record_id_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,6}-[0-9]{1,4}"
}

proptest! {
    /// Backoff never shrinks as attempts accumulate and never passes the cap
    #[test]
    fn backoff_is_monotonic_and_capped(
        base in 1u64..600,
        multiplier in 1.0f64..5.0,
        cap in 1u64..7200,
        attempt in 1u32..40,
    ) {
        let policy = policy(base, multiplier, cap, 0.0);
        let current = policy.delay_for(attempt);
        let next = policy.delay_for(attempt + 1);

        prop_assert!(next >= current);
        prop_assert!(current <= Duration::from_secs(cap));
    }

    /// Jitter stays within the configured fraction of the un-jittered delay
    #[test]
    fn jitter_stays_within_bounds(
        base in 1u64..600,
        attempt in 1u32..8,
        jitter in 0.0f64..0.5,
    ) {
        let policy = policy(base, 3.0, 3600, jitter);
        let delay = policy.delay_for(attempt).as_secs_f64();
        let jittered = policy.jittered_delay_for(attempt).as_secs_f64();

        prop_assert!(jittered >= delay * (1.0 - jitter) - 1e-6);
        prop_assert!(jittered <= (delay * (1.0 + jitter)).min(3600.0) + 1e-6);
    }

    /// Retryable failures dead-letter exactly when the budget is spent
    #[test]
    fn retryable_failures_respect_max_attempts(max_attempts in 1u32..10, attempt in 1u32..12) {
        let controller = RetryController::new(&RetryConfig {
            max_attempts,
            base_backoff_seconds: 1,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        });
        let failure = DispatchFailure::Remote(RemoteError::Server {
            status: 502,
            body: String::new(),
        });

        let decision = controller.decide(&context(attempt), &failure, Utc::now());
        prop_assert_eq!(decision.is_dead_letter(), attempt >= max_attempts);
    }

    /// Non-retryable failures never get more than the defensive retries
    #[test]
    fn non_retryable_failures_short_circuit(attempt in 1u32..6, defensive_retries in 0u32..3) {
        let controller = RetryController::new(&RetryConfig {
            max_attempts: 5,
            defensive_retries,
            ..RetryConfig::default()
        });
        let failure = DispatchFailure::Remote(RemoteError::Client {
            status: 400,
            body: String::new(),
        });

        let decision = controller.decide(&context(attempt), &failure, Utc::now());
        prop_assert_eq!(decision.is_dead_letter(), attempt > defensive_retries);
    }

    /// Sequences are contiguous from 1 and keys are stable across calls
    #[test]
    fn prepared_items_are_sequenced_deterministically(
        records in prop::collection::vec(record_id_strategy(), 1..12),
    ) {
        let items = || {
            records
                .iter()
                .map(|record| EnqueueItem::create("note", record.clone(), json!({})))
                .collect::<Vec<_>>()
        };

        let first = prepare_items("corr", items()).unwrap();
        let second = prepare_items("corr", items()).unwrap();

        for (index, row) in first.iter().enumerate() {
            prop_assert_eq!(row.sequence, index as i32 + 1);
            prop_assert_eq!(row.idempotency_key, second[index].idempotency_key);
            prop_assert_eq!(
                row.idempotency_key,
                idempotency_key("corr", "note", &row.record_id, row.sequence)
            );
        }
    }

    /// Moving characters between key components changes the key
    #[test]
    fn idempotency_keys_separate_components(left in "[a-z]{1,5}", right in "[a-z]{1,5}") {
        let joined = idempotency_key(&format!("{left}{right}"), "t", "r", 1);
        let split = idempotency_key(&left, &format!("{right}t"), "r", 1);
        prop_assert_ne!(joined, split);
    }
}
