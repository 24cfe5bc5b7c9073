// # Subscription Hub
//
// Filtered, paused/resumable, backpressured delivery of freshly persisted
// deltas. On each write the hub offers the delta to every subscription;
// the subscription's matcher reuses the query filter logic (minus index
// lookups) and, on match, enqueues into a bounded per-subscription buffer
// drained synchronously to the handler.
//
// ## Overflow policies
//
// - **DropOldest**: shift the oldest buffered delta out and drop it.
// - **DropNewest**: reject the incoming delta.
// - **Error**: surface a `BufferOverflow` failure to the producer.
// - **Block**: exceed capacity. Discouraged; retained for batch cases
//   where the producer drains immediately afterwards.
//
// A warning callback fires when a buffer crosses its configured fill
// fraction. Handler errors are logged and never disturb other
// subscriptions or the write path.

use crate::common::DeltaId;
use crate::delta::Delta;
use crate::query::DeltaFilter;
use crate::{Result, RhizomeError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Default per-subscription buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Default buffer fill fraction that triggers the warning callback.
pub const DEFAULT_WARN_THRESHOLD: f64 = 0.8;

pub type SubscriptionId = String;

/// What to do when a subscription's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
    Error,
    Block,
}

/// Per-subscription delivery configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Fill fraction in `(0, 1]` at which the warning callback fires.
    pub warn_threshold: f64,
    pub start_paused: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            start_paused: false,
        }
    }
}

/// Observable delivery counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub received: u64,
    pub processed: u64,
    pub dropped: u64,
    pub overflow_events: u64,
    pub size: usize,
    pub capacity: usize,
}

pub type DeltaHandler = Arc<dyn Fn(&Delta) -> Result<()> + Send + Sync>;
pub type WarningCallback = Arc<dyn Fn(&str, usize, usize) + Send + Sync>;

struct SubscriptionEntry {
    id: SubscriptionId,
    filter: DeltaFilter,
    config: SubscriptionConfig,
    handler: DeltaHandler,
    paused: bool,
    buffer: VecDeque<Delta>,
    received: u64,
    processed: u64,
    dropped: u64,
    overflow_events: u64,
    warned: bool,
}

impl SubscriptionEntry {
    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            received: self.received,
            processed: self.processed,
            dropped: self.dropped,
            overflow_events: self.overflow_events,
            size: self.buffer.len(),
            capacity: self.config.capacity,
        }
    }

    /// Drain the buffer to the handler. Handler failures are logged and
    /// counted as processed; they never propagate.
    fn drain(&mut self) {
        while let Some(delta) = self.buffer.pop_front() {
            if let Err(e) = (self.handler)(&delta) {
                warn!(subscription = %self.id, delta = %delta.id, error = %e,
                    "subscription handler failed");
            }
            self.processed += 1;
        }
    }
}

/// Fan-out point between the write path and subscribers.
pub struct SubscriptionHub {
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Mutex<SubscriptionEntry>>>>,
    warning_callback: RwLock<Option<WarningCallback>>,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            warning_callback: RwLock::new(None),
        }
    }

    /// Register a subscription; returns its id.
    pub fn subscribe<F>(
        &self,
        filter: DeltaFilter,
        config: SubscriptionConfig,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&Delta) -> Result<()> + Send + Sync + 'static,
    {
        let id = format!("sub-{}", Uuid::new_v4());
        let entry = SubscriptionEntry {
            id: id.clone(),
            paused: config.start_paused,
            filter,
            config,
            handler: Arc::new(handler),
            buffer: VecDeque::new(),
            received: 0,
            processed: 0,
            dropped: 0,
            overflow_events: 0,
            warned: false,
        };
        self.subscriptions
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(entry)));
        id
    }

    /// Remove a subscription and drop its buffered deltas.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscriptions.write().remove(id).is_some()
    }

    /// Stop draining; the buffer keeps accepting matched deltas.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.with_entry(id, |entry| {
            entry.paused = true;
        })
    }

    /// Resume draining, flushing anything buffered while paused.
    pub fn resume(&self, id: &str) -> Result<()> {
        self.with_entry(id, |entry| {
            entry.paused = false;
            entry.drain();
        })
    }

    pub fn stats(&self, id: &str) -> Option<SubscriptionStats> {
        self.subscriptions
            .read()
            .get(id)
            .map(|entry| entry.lock().stats())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Install the buffer fill-fraction warning callback.
    pub fn set_warning_callback<F>(&self, callback: F)
    where
        F: Fn(&str, usize, usize) + Send + Sync + 'static,
    {
        *self.warning_callback.write() = Some(Arc::new(callback));
    }

    /// Offer a freshly persisted delta to every subscription.
    ///
    /// Returns the overflow failures from subscriptions using the `Error`
    /// policy; the write path logs them without aborting the write.
    pub fn offer(&self, delta: &Delta) -> Vec<(SubscriptionId, RhizomeError)> {
        let subscriptions: Vec<Arc<Mutex<SubscriptionEntry>>> =
            self.subscriptions.read().values().cloned().collect();
        let warning_callback = self.warning_callback.read().clone();

        let mut failures = Vec::new();
        for entry in subscriptions {
            let mut entry = entry.lock();
            if !entry.filter.matches(delta) {
                continue;
            }
            entry.received += 1;

            let full = entry.buffer.len() >= entry.config.capacity;
            if full {
                entry.overflow_events += 1;
                match entry.config.overflow {
                    OverflowPolicy::DropOldest => {
                        entry.buffer.pop_front();
                        entry.dropped += 1;
                        entry.buffer.push_back(delta.clone());
                    }
                    OverflowPolicy::DropNewest => {
                        entry.dropped += 1;
                    }
                    OverflowPolicy::Error => {
                        entry.dropped += 1;
                        failures.push((
                            entry.id.clone(),
                            RhizomeError::BufferOverflow(format!(
                                "subscription {} at capacity {}",
                                entry.id, entry.config.capacity
                            )),
                        ));
                    }
                    OverflowPolicy::Block => {
                        entry.buffer.push_back(delta.clone());
                    }
                }
            } else {
                entry.buffer.push_back(delta.clone());
            }

            self.check_warning(&mut entry, warning_callback.as_ref());

            if !entry.paused {
                entry.drain();
            }
        }
        failures
    }

    fn check_warning(
        &self,
        entry: &mut SubscriptionEntry,
        callback: Option<&WarningCallback>,
    ) {
        let threshold =
            (entry.config.capacity as f64 * entry.config.warn_threshold).ceil() as usize;
        let size = entry.buffer.len();
        if size >= threshold.max(1) {
            if !entry.warned {
                entry.warned = true;
                if let Some(cb) = callback {
                    cb(&entry.id, size, entry.config.capacity);
                }
            }
        } else {
            entry.warned = false;
        }
    }

    fn with_entry<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut SubscriptionEntry),
    {
        let subscriptions = self.subscriptions.read();
        let entry = subscriptions
            .get(id)
            .ok_or_else(|| RhizomeError::NotFound(format!("subscription {id}")))?;
        f(&mut entry.lock());
        Ok(())
    }

    /// Ids of the current subscriptions.
    pub fn subscription_ids(&self) -> Vec<DeltaId> {
        self.subscriptions.read().keys().cloned().collect()
    }
}
