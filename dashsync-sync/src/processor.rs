//! Update processor: queues, deduplicates, merges and batches updates.
//!
//! Items are held until the batch is full or the debounce window closes.
//! Arrivals push the window out only while the queue is below the batch
//! size, and never past `max_batch_delay` after the first queued item, so a
//! burst cannot starve processing.
//!
//! `process_batch` takes `&mut self`: one run at a time is enforced by the
//! borrow checker, and every trigger that arrives while the owner is busy
//! folds into the single pending deadline.

use crate::config::BatchConfig;
use crate::error::HandlerError;
use crate::events::{Listeners, SubscriptionId};
use crate::schedule::Debounce;
use dashsync_types::{BatchUpdate, OperationId, Timestamp, UpdateItem, UpdateKey};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Callback receiving each processed batch.
pub type BatchHandler = dyn FnMut(&BatchUpdate) -> Result<(), HandlerError> + Send;

/// Counters describing processor activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Items waiting to be processed.
    pub queued: usize,
    /// Batches delivered to handlers.
    pub batches_processed: u64,
    /// Items delivered to handlers.
    pub items_processed: u64,
    /// Items folded into an earlier item with the same key.
    pub items_merged: u64,
    /// Handler calls that failed or panicked.
    pub handler_errors: u64,
    /// When the last batch finished.
    pub last_batch_at: Option<Timestamp>,
}

/// Batches updates and fans them out to handlers.
pub struct UpdateProcessor {
    config: BatchConfig,
    /// Latest merged item per key (dedup mode).
    pending: HashMap<UpdateKey, UpdateItem>,
    /// Arrival order of keys in `pending`.
    order: VecDeque<UpdateKey>,
    /// Plain arrival queue (dedup disabled).
    fifo: VecDeque<UpdateItem>,
    debounce: Debounce,
    handlers: Listeners<BatchHandler>,
    stats: ProcessorStats,
}

impl UpdateProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        let debounce = Debounce::new(Duration::from_millis(config.batch_delay_ms))
            .with_max_wait(Duration::from_millis(
                config.max_batch_delay_ms.max(config.batch_delay_ms),
            ));
        Self {
            config,
            pending: HashMap::new(),
            order: VecDeque::new(),
            fifo: VecDeque::new(),
            debounce,
            handlers: Listeners::new(),
            stats: ProcessorStats::default(),
        }
    }

    /// Returns the batch configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Registers a batch handler.
    pub fn on_update<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&BatchUpdate) -> Result<(), HandlerError> + Send + 'static,
    {
        self.handlers.add(Box::new(handler))
    }

    /// Unregisters a batch handler.
    pub fn off_update(&mut self, id: SubscriptionId) -> bool {
        self.handlers.remove(id)
    }

    /// Queues an item and (re)schedules processing.
    pub fn add(&mut self, item: UpdateItem, now: Timestamp) {
        if self.config.dedup {
            let key = item.key();
            match self.pending.get_mut(&key) {
                Some(existing) => {
                    existing.merge(&item);
                    self.stats.items_merged += 1;
                    debug!("Merged update into queued {}", key);
                }
                None => {
                    self.order.push_back(key.clone());
                    self.pending.insert(key, item);
                }
            }
        } else {
            self.fifo.push_back(item);
        }
        self.schedule(now);
    }

    /// Queues several items.
    pub fn add_batch(&mut self, items: impl IntoIterator<Item = UpdateItem>, now: Timestamp) {
        for item in items {
            self.add(item, now);
        }
    }

    fn schedule(&mut self, now: Timestamp) {
        if self.queued_len() >= self.config.batch_size {
            self.debounce.trigger_now(now);
        } else {
            self.debounce.call(now);
        }
    }

    /// Number of queued items.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        if self.config.dedup {
            self.order.len()
        } else {
            self.fifo.len()
        }
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued_len() == 0
    }

    /// When the next batch is due, if anything is queued.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.debounce.deadline()
    }

    /// Processes one batch if it is due at `now`.
    pub fn poll(&mut self, now: Timestamp) -> Option<BatchUpdate> {
        if self.debounce.is_due(now) {
            self.process_batch(now)
        } else {
            None
        }
    }

    /// Synchronously drains every queued item into batches.
    pub fn flush(&mut self, now: Timestamp) -> Vec<BatchUpdate> {
        let mut batches = Vec::new();
        while let Some(batch) = self.process_batch(now) {
            batches.push(batch);
        }
        batches
    }

    /// Drops every queued item and cancels the pending deadline.
    /// Returns how many items were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queued_len();
        self.pending.clear();
        self.order.clear();
        self.fifo.clear();
        self.debounce.cancel();
        dropped
    }

    /// Drops queued items carrying any of `ids`. A merged item carries the
    /// id of its latest contribution. Returns how many items were dropped.
    pub fn discard(&mut self, ids: &[OperationId]) -> usize {
        let before = self.queued_len();
        if self.config.dedup {
            self.pending.retain(|_, item| !ids.contains(&item.id));
            let pending = &self.pending;
            self.order.retain(|key| pending.contains_key(key));
        } else {
            self.fifo.retain(|item| !ids.contains(&item.id));
        }
        if self.is_empty() {
            self.debounce.cancel();
        }
        before - self.queued_len()
    }

    /// Returns activity counters.
    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            queued: self.queued_len(),
            ..self.stats.clone()
        }
    }

    /// Drains up to one batch, merges and orders it, and runs every handler.
    ///
    /// Returns the processed batch so the owner can route it further, or
    /// `None` if nothing was queued.
    pub fn process_batch(&mut self, now: Timestamp) -> Option<BatchUpdate> {
        let drained = self.drain(self.config.batch_size);
        if drained.is_empty() {
            self.debounce.cancel();
            return None;
        }

        let mut items = merge_by_key(drained, &mut self.stats.items_merged);
        items.sort_by(|a, b| {
            b.effective_priority()
                .cmp(&a.effective_priority())
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });

        let mut batch = BatchUpdate::new(items, now);
        for (id, handler) in self.handlers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| handler(&batch))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Batch handler {} failed on batch {}: {}", id, batch.id, e);
                    self.stats.handler_errors += 1;
                }
                Err(_) => {
                    error!("Batch handler {} panicked on batch {}", id, batch.id);
                    self.stats.handler_errors += 1;
                }
            }
        }
        batch.processed_at = Some(now);

        self.stats.batches_processed += 1;
        self.stats.items_processed += batch.items.len() as u64;
        self.stats.last_batch_at = Some(now);
        debug!("Processed batch {} with {} items", batch.id, batch.items.len());

        self.debounce.cancel();
        if !self.is_empty() {
            self.debounce.trigger_now(now);
        }
        Some(batch)
    }

    fn drain(&mut self, limit: usize) -> Vec<UpdateItem> {
        let limit = limit.max(1);
        let mut drained = Vec::with_capacity(limit.min(self.queued_len()));
        if self.config.dedup {
            while drained.len() < limit {
                let Some(key) = self.order.pop_front() else {
                    break;
                };
                if let Some(item) = self.pending.remove(&key) {
                    drained.push(item);
                }
            }
        } else {
            while drained.len() < limit {
                let Some(item) = self.fifo.pop_front() else {
                    break;
                };
                drained.push(item);
            }
        }
        drained
    }
}

/// Folds items sharing a key into the first occurrence, in arrival order.
fn merge_by_key(items: Vec<UpdateItem>, merged: &mut u64) -> Vec<UpdateItem> {
    let mut index: HashMap<UpdateKey, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<UpdateItem> = Vec::with_capacity(items.len());
    for item in items {
        let key = item.key();
        match index.get(&key) {
            Some(&pos) => {
                out[pos].merge(&item);
                *merged += 1;
            }
            None => {
                index.insert(key, out.len());
                out.push(item);
            }
        }
    }
    out
}
