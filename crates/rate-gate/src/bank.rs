//! Gate registry and permits

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A rate-gated outbound service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Service {
    /// Content enhancement calls
    Enhancement,
    /// Image edit calls (shared by every rotated key)
    ImageEdit,
    /// A destination store, identified by its URL or domain
    Store(String),
}

impl Service {
    /// Label for logs and metrics. All stores share the `store` label to keep
    /// metric cardinality bounded.
    pub fn label(&self) -> &'static str {
        match self {
            Service::Enhancement => "enhancement",
            Service::ImageEdit => "image_edit",
            Service::Store(_) => "store",
        }
    }
}

/// Capacity and post-call delay of one gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSettings {
    pub capacity: usize,
    pub delay: Duration,
}

impl GateSettings {
    pub const fn new(capacity: usize, delay: Duration) -> Self {
        Self { capacity, delay }
    }
}

/// Normalize a store identity so equivalent spellings share a gate.
///
/// `https://Shop.Example.com/` and `shop.example.com` map to the same key.
pub fn normalize_store(store: &str) -> String {
    let lower = store.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    without_scheme.trim_end_matches('/').to_string()
}

struct Gate {
    semaphore: Arc<Semaphore>,
    delay: Duration,
}

impl Gate {
    fn new(settings: GateSettings) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(settings.capacity)),
            delay: settings.delay,
        })
    }
}

/// A held gate slot.
///
/// Call [`GatePermit::release`] after the outbound call to serve the
/// service's post-call delay before the slot frees. Dropping the permit
/// without releasing frees the slot immediately.
#[must_use = "a permit frees its slot as soon as it is dropped"]
pub struct GatePermit {
    permit: OwnedSemaphorePermit,
    delay: Duration,
    service: &'static str,
}

impl GatePermit {
    /// Sleep the post-call delay, then free the slot.
    pub async fn release(self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        debug!(service = self.service, "gate released");
        drop(self.permit);
    }
}

/// Per-service concurrency gates.
///
/// Fixed gates exist for enhancement and image edit. Store gates are created
/// lazily on first use and live for the life of the bank.
pub struct GateBank {
    enhancement: Arc<Gate>,
    image_edit: Arc<Gate>,
    store_delay: Duration,
    stores: Mutex<HashMap<String, Arc<Gate>>>,
}

impl Default for GateBank {
    fn default() -> Self {
        Self::new(
            GateSettings::new(2, Duration::from_millis(500)),
            GateSettings::new(2, Duration::from_millis(1000)),
            Duration::from_millis(600),
        )
    }
}

impl GateBank {
    /// Store gates always have capacity 1.
    pub const STORE_CAPACITY: usize = 1;

    pub fn new(enhancement: GateSettings, image_edit: GateSettings, store_delay: Duration) -> Self {
        info!(
            enhancement_capacity = enhancement.capacity,
            image_edit_capacity = image_edit.capacity,
            store_delay_ms = store_delay.as_millis() as u64,
            "gate bank initialized"
        );
        Self {
            enhancement: Gate::new(enhancement),
            image_edit: Gate::new(image_edit),
            store_delay,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a slot on the service's gate.
    pub async fn acquire(&self, service: &Service) -> Result<GatePermit> {
        let gate = self.gate(service);
        let started = Instant::now();
        let permit = gate
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed(service.label().to_string()))?;
        let waited = started.elapsed();
        metrics::histogram!("gate_wait_seconds", "service" => service.label())
            .record(waited.as_secs_f64());
        debug!(
            service = service.label(),
            wait_ms = waited.as_millis() as u64,
            "gate acquired"
        );
        Ok(GatePermit {
            permit,
            delay: gate.delay,
            service: service.label(),
        })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, service: &Service) -> Result<Option<GatePermit>> {
        let gate = self.gate(service);
        match gate.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(GatePermit {
                permit,
                delay: gate.delay,
                service: service.label(),
            })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(Error::Closed(service.label().to_string())),
        }
    }

    /// Run `call` inside the service's gate, serving the post-call delay
    /// afterwards regardless of the call's outcome.
    pub async fn run<F, T>(&self, service: &Service, call: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire(service).await?;
        let output = call.await;
        permit.release().await;
        Ok(output)
    }

    /// Number of store gates created so far.
    pub fn store_count(&self) -> usize {
        self.stores.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn gate(&self, service: &Service) -> Arc<Gate> {
        match service {
            Service::Enhancement => self.enhancement.clone(),
            Service::ImageEdit => self.image_edit.clone(),
            Service::Store(store) => {
                let key = normalize_store(store);
                let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
                stores
                    .entry(key)
                    .or_insert_with_key(|key| {
                        info!(store = %key, "creating store gate");
                        Gate::new(GateSettings::new(Self::STORE_CAPACITY, self.store_delay))
                    })
                    .clone()
            }
        }
    }
}
