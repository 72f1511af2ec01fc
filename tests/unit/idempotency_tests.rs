//! Unit tests for the idempotency store.
//!
//! Covers replay within the TTL, fingerprint conflicts, in-flight
//! coalescing, and sweep behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flint_gateway::gateway::idempotency::IdempotencyStore;
use serde_json::json;

/// The same `(key, fingerprint)` replays the stored result.
#[tokio::test]
async fn same_key_and_fingerprint_replays() {
    let store = IdempotencyStore::new(Duration::from_secs(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let first = {
        let calls = Arc::clone(&calls);
        store
            .execute("k1", "fp", async move {
                calls.fetch_add(1, Ordering::SeqCst);
                json!({ "reply": "hello" })
            })
            .await
    };
    assert!(!first.cached);
    assert!(!first.conflict);

    let second = {
        let calls = Arc::clone(&calls);
        store
            .execute("k1", "fp", async move {
                calls.fetch_add(1, Ordering::SeqCst);
                json!({ "reply": "different" })
            })
            .await
    };
    assert!(second.cached, "second submission must be served from cache");
    assert_eq!(second.result, first.result, "replayed result must be identical");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "task must run exactly once");
}

/// The same key with a different fingerprint conflicts.
#[tokio::test]
async fn fingerprint_mismatch_is_a_conflict() {
    let store = IdempotencyStore::new(Duration::from_secs(60));

    store.execute("k1", "fp-a", async { json!({ "n": 1 }) }).await;
    let outcome = store.execute("k1", "fp-b", async { json!({ "n": 2 }) }).await;

    assert!(outcome.conflict);
    assert!(outcome.cached);
    assert_eq!(outcome.result, json!({ "error": "Idempotency key conflict." }));
}

/// A concurrent submission for an in-flight key awaits the first result.
#[tokio::test]
async fn in_flight_submissions_coalesce() {
    let store = Arc::new(IdempotencyStore::new(Duration::from_secs(60)));
    let calls = Arc::new(AtomicUsize::new(0));

    let slow = {
        let store = Arc::clone(&store);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            store
                .execute("k1", "fp", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    json!({ "winner": true })
                })
                .await
        })
    };

    // Give the first execution time to register its in-flight slot.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let joined = store
        .execute("k1", "fp", async { json!({ "winner": false }) })
        .await;
    let first = slow.await.expect("task must not panic");

    assert!(!first.cached);
    assert!(joined.cached, "joined submission must report cached");
    assert_eq!(joined.result, first.result);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Entries older than the TTL are swept; a reused key runs fresh.
#[tokio::test]
async fn expired_entries_are_swept() {
    let store = IdempotencyStore::new(Duration::from_millis(10));

    store.execute("k1", "fp-a", async { json!({ "n": 1 }) }).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Different fingerprint would conflict if the entry survived.
    let outcome = store.execute("k1", "fp-b", async { json!({ "n": 2 }) }).await;
    assert!(!outcome.conflict, "swept entry must not conflict");
    assert!(!outcome.cached);
    assert_eq!(outcome.result, json!({ "n": 2 }));
}

/// Distinct keys never interact.
#[tokio::test]
async fn distinct_keys_are_independent() {
    let store = IdempotencyStore::new(Duration::from_secs(60));

    let a = store.execute("k1", "fp", async { json!({ "n": 1 }) }).await;
    let b = store.execute("k2", "fp", async { json!({ "n": 2 }) }).await;

    assert!(!a.cached);
    assert!(!b.cached);
    assert_ne!(a.result, b.result);
}
