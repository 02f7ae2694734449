//! Key state machine and round-robin key selection
//!
//! The rotator holds per-key status (Available, Exhausted, Disabled) behind a
//! single mutex together with the round-robin cursor, so selection and state
//! transitions never race. Clients are constructed lazily the first time a
//! key is selected.
//!
//! Exhaustion is sticky: unlike a cooldown it does not lapse on its own. The
//! supervisor calls `reset_all` once the reset boundary has passed.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use common::Secret;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ledger::ExhaustionLedger;
use crate::schedule::ResetSchedule;

/// Runtime status of a key.
///
/// Transitions:
/// - Available → Exhausted (quota failure)
/// - Available → Disabled (401/403)
/// - Exhausted → Available (`reset_all`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    Available,
    Exhausted { until: DateTime<Utc> },
    Disabled,
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Available => "available",
            KeyStatus::Exhausted { .. } => "exhausted",
            KeyStatus::Disabled => "disabled",
        }
    }
}

/// A selected key and its client.
pub struct Lease<C> {
    /// Key label (`key-1`, `key-2`, ...), used to report failures back.
    pub key: String,
    pub client: Arc<C>,
}

/// Short SHA-256 fingerprint identifying a key without revealing it.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

struct KeySlot<C> {
    label: String,
    fingerprint: String,
    secret: Secret<String>,
    client: OnceLock<Arc<C>>,
}

struct RotatorState {
    statuses: Vec<KeyStatus>,
    usage: Vec<u64>,
    cursor: usize,
}

impl RotatorState {
    fn available(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| matches!(s, KeyStatus::Available))
            .count()
    }
}

type Connect<C> = Box<dyn Fn(&str) -> C + Send + Sync>;

/// Round-robin pool of keys for one capability.
pub struct KeyRotator<C> {
    slots: Vec<KeySlot<C>>,
    connect: Connect<C>,
    state: Mutex<RotatorState>,
    schedule: ResetSchedule,
    ledger: Option<ExhaustionLedger>,
}

impl<C> KeyRotator<C> {
    /// Create a rotator over `keys`. `connect` builds a client for one key and
    /// is called at most once per key, on first selection.
    pub fn new(
        keys: Vec<Secret<String>>,
        connect: impl Fn(&str) -> C + Send + Sync + 'static,
        schedule: ResetSchedule,
    ) -> Self {
        let slots: Vec<KeySlot<C>> = keys
            .into_iter()
            .enumerate()
            .map(|(i, secret)| KeySlot {
                label: format!("key-{}", i + 1),
                fingerprint: fingerprint(secret.expose()),
                secret,
                client: OnceLock::new(),
            })
            .collect();
        info!(keys = slots.len(), "key rotator initialized");
        let n = slots.len();
        Self {
            slots,
            connect: Box::new(connect),
            state: Mutex::new(RotatorState {
                statuses: vec![KeyStatus::Available; n],
                usage: vec![0; n],
                cursor: 0,
            }),
            schedule,
            ledger: None,
        }
    }

    /// Attach a persisted ledger. Keys the ledger still lists as exhausted
    /// start out Exhausted; future exhaustion is recorded in it.
    pub async fn with_ledger(mut self, ledger: ExhaustionLedger) -> Self {
        let active = ledger.active(Utc::now()).await;
        {
            let state = self.state.get_mut();
            for (i, slot) in self.slots.iter().enumerate() {
                if let Some(until) = active.get(&slot.fingerprint) {
                    info!(key = %slot.label, %until, "key still exhausted from previous run");
                    state.statuses[i] = KeyStatus::Exhausted { until: *until };
                }
            }
        }
        self.ledger = Some(ledger);
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Next reset boundary according to the configured schedule.
    pub fn next_reset(&self) -> DateTime<Utc> {
        self.schedule.next_reset_after(Utc::now())
    }

    pub fn schedule(&self) -> &ResetSchedule {
        &self.schedule
    }

    /// Select the next Available key round-robin and return its client.
    ///
    /// Returns `AllExhausted` when no key is Available (including an empty
    /// pool).
    pub async fn next_client(&self) -> Result<Lease<C>> {
        let mut state = self.state.lock().await;
        let n = self.slots.len();

        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if state.statuses[idx] != KeyStatus::Available {
                continue;
            }
            state.cursor = (idx + 1) % n;
            state.usage[idx] += 1;

            let slot = &self.slots[idx];
            let client = slot
                .client
                .get_or_init(|| {
                    debug!(key = %slot.label, "connecting client");
                    Arc::new((self.connect)(slot.secret.expose()))
                })
                .clone();
            return Ok(Lease {
                key: slot.label.clone(),
                client,
            });
        }

        Err(Error::AllExhausted {
            reset_at: self.next_reset(),
        })
    }

    /// Retire a key after a quota failure.
    ///
    /// Returns the number of keys still Available; the caller retries with
    /// the next key. When this was the last Available key, returns
    /// `AllExhausted` instead.
    pub async fn mark_exhausted(&self, key: &str) -> Result<usize> {
        let idx = self.index_of(key)?;
        let reset_at = self.next_reset();
        let (remaining, newly_exhausted) = {
            let mut state = self.state.lock().await;
            let newly = state.statuses[idx] == KeyStatus::Available;
            if newly {
                state.statuses[idx] = KeyStatus::Exhausted { until: reset_at };
            }
            (state.available(), newly)
        };

        if newly_exhausted {
            let slot = &self.slots[idx];
            warn!(key, remaining, %reset_at, "key quota exhausted");
            metrics::counter!("key_pool_exhausted_total", "key" => slot.label.clone()).increment(1);
            if let Some(ledger) = &self.ledger {
                if let Err(e) = ledger.record(&slot.fingerprint, reset_at).await {
                    warn!(key, error = %e, "failed to persist key exhaustion");
                }
            }
        }

        if remaining == 0 {
            return Err(Error::AllExhausted { reset_at });
        }
        Ok(remaining)
    }

    /// Disable a key rejected by the service. Disabled keys count as used up
    /// when deciding total exhaustion and are not restored by `reset_all`.
    pub async fn disable(&self, key: &str) -> Result<usize> {
        let idx = self.index_of(key)?;
        let remaining = {
            let mut state = self.state.lock().await;
            if state.statuses[idx] != KeyStatus::Disabled {
                warn!(key, "key disabled (rejected by service)");
                state.statuses[idx] = KeyStatus::Disabled;
            }
            state.available()
        };
        if remaining == 0 {
            return Err(Error::AllExhausted {
                reset_at: self.next_reset(),
            });
        }
        Ok(remaining)
    }

    /// Return every Exhausted key to Available and clear the ledger.
    pub async fn reset_all(&self) {
        let restored = {
            let mut state = self.state.lock().await;
            let mut restored = 0usize;
            for status in state.statuses.iter_mut() {
                if matches!(status, KeyStatus::Exhausted { .. }) {
                    *status = KeyStatus::Available;
                    restored += 1;
                }
            }
            restored
        };
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.clear().await {
                warn!(error = %e, "failed to clear exhaustion ledger");
            }
        }
        metrics::counter!("key_pool_resets_total").increment(1);
        info!(restored, "key exhaustion reset");
    }

    /// Snapshot of one key's status.
    pub async fn status(&self, key: &str) -> Result<KeyStatus> {
        let idx = self.index_of(key)?;
        Ok(self.state.lock().await.statuses[idx].clone())
    }

    /// Pool health summary.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;

        let keys: Vec<serde_json::Value> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let mut entry = serde_json::json!({
                    "key": slot.label,
                    "fingerprint": slot.fingerprint,
                    "status": state.statuses[i].label(),
                    "usage": state.usage[i],
                });
                if let KeyStatus::Exhausted { until } = &state.statuses[i] {
                    entry["exhausted_until"] = serde_json::json!(until.to_rfc3339());
                }
                entry
            })
            .collect();

        let total = self.slots.len();
        let available = state.available();
        let exhausted = state
            .statuses
            .iter()
            .filter(|s| matches!(s, KeyStatus::Exhausted { .. }))
            .count();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_available": available,
            "keys_exhausted": exhausted,
            "keys_disabled": total - available - exhausted,
            "keys": keys,
        })
    }

    fn index_of(&self, key: &str) -> Result<usize> {
        self.slots
            .iter()
            .position(|slot| slot.label == key)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}
