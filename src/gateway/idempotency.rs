//! Idempotency store: in-flight coalescing plus a TTL replay cache.
//!
//! The lock is held only to register or look up a slot, never across the
//! task's I/O. Conflicts are detected against completed entries only; an
//! in-flight future for the same key is awaited regardless of fingerprint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Default retention for completed entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Outcome of an idempotent execution.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentOutcome {
    /// The stored or freshly computed result.
    pub result: Value,
    /// Whether the result was served from the cache or a coalesced flight.
    pub cached: bool,
    /// Whether the key was reused with a different fingerprint.
    pub conflict: bool,
}

enum Slot {
    Done {
        at: Instant,
        fingerprint: String,
        result: Value,
    },
    Pending {
        tx: broadcast::Sender<Value>,
    },
}

/// Decision taken while the slot lock is held.
enum Claim {
    /// Completed entry with a different fingerprint.
    Conflict,
    /// Completed entry with a matching fingerprint.
    Replay(Value),
    /// Another execution is in flight; await its broadcast.
    Join(broadcast::Receiver<Value>),
    /// This caller owns the execution.
    Run(broadcast::Sender<Value>),
}

/// TTL replay cache with in-flight coalescing.
pub struct IdempotencyStore {
    ttl: Duration,
    inner: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl IdempotencyStore {
    /// Create a store with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` under idempotency key `key`.
    ///
    /// - A completed entry with a matching fingerprint replays its result.
    /// - A completed entry with a different fingerprint is a conflict.
    /// - An in-flight execution for the key is awaited and its result shared.
    /// - Otherwise the task runs, and its result is stored for the TTL.
    pub async fn execute<F>(&self, key: &str, fingerprint: &str, task: F) -> IdempotentOutcome
    where
        F: std::future::Future<Output = Value>,
    {
        match self.claim(key, fingerprint) {
            Claim::Conflict => IdempotentOutcome {
                result: serde_json::json!({ "error": "Idempotency key conflict." }),
                cached: true,
                conflict: true,
            },
            Claim::Replay(result) => IdempotentOutcome {
                result,
                cached: true,
                conflict: false,
            },
            Claim::Join(mut rx) => match rx.recv().await {
                Ok(result) => IdempotentOutcome {
                    result,
                    cached: true,
                    conflict: false,
                },
                Err(_) => IdempotentOutcome {
                    result: serde_json::json!({ "error": "Idempotent request failed." }),
                    cached: true,
                    conflict: false,
                },
            },
            Claim::Run(tx) => {
                let result = task.await;
                if let Ok(mut slots) = self.inner.lock() {
                    slots.insert(
                        key.to_owned(),
                        Slot::Done {
                            at: Instant::now(),
                            fingerprint: fingerprint.to_owned(),
                            result: result.clone(),
                        },
                    );
                }
                let _ = tx.send(result.clone());
                IdempotentOutcome {
                    result,
                    cached: false,
                    conflict: false,
                }
            }
        }
    }

    /// Inspect and update the slot table for `key` without awaiting.
    fn claim(&self, key: &str, fingerprint: &str) -> Claim {
        let Ok(mut slots) = self.inner.lock() else {
            let (tx, _rx) = broadcast::channel(8);
            return Claim::Run(tx);
        };

        sweep(&mut slots, self.ttl);

        match slots.get(key) {
            Some(Slot::Done {
                fingerprint: stored,
                result,
                ..
            }) => {
                if stored == fingerprint {
                    Claim::Replay(result.clone())
                } else {
                    debug!(key, "idempotency key conflict");
                    Claim::Conflict
                }
            }
            Some(Slot::Pending { tx }) => Claim::Join(tx.subscribe()),
            None => {
                let (tx, _rx) = broadcast::channel(8);
                slots.insert(key.to_owned(), Slot::Pending { tx: tx.clone() });
                Claim::Run(tx)
            }
        }
    }
}

/// Drop completed entries older than `ttl`.
fn sweep(slots: &mut HashMap<String, Slot>, ttl: Duration) {
    slots.retain(|_, slot| match slot {
        Slot::Done { at, .. } => at.elapsed() < ttl,
        Slot::Pending { .. } => true,
    });
}
