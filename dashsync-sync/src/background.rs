//! Background sync coordinator.
//!
//! Holds outbound operations while the push connection cannot carry them,
//! retries them with exponential backoff, and drives the polling fallback.
//! Like every component it is a deadline-based state machine; the session
//! decides when to drain it.

use crate::config::{backoff_delay, BackgroundConfig};
use crate::events::SyncEvent;
use crate::schedule::Throttle;
use dashsync_types::{OperationId, Timestamp, UpdateItem};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// An outbound operation waiting in the retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    /// The update to deliver.
    pub item: UpdateItem,
    /// Arrival order; preserved across retries.
    pub seq: u64,
    /// Failed delivery attempts so far.
    pub failures: u32,
    /// Earliest time the next attempt may start.
    pub next_attempt_at: Timestamp,
}

impl QueuedOperation {
    /// The operation id (the update item id).
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.item.id
    }

    fn priority(&self) -> i32 {
        self.item.effective_priority()
    }
}

/// What happened to an operation after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another attempt is scheduled.
    Scheduled { at: Timestamp, failures: u32 },
    /// Retries are exhausted; the operation was reported and discarded.
    Failed { attempts: u32 },
}

/// Counters describing coordinator activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackgroundStats {
    /// Operations waiting in the queue.
    pub queued: usize,
    /// Operations dropped because the queue was full.
    pub dropped: u64,
    /// Operations that exhausted their retries.
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Polls started.
    pub polls: u64,
    /// Whether the polling fallback is active.
    pub polling: bool,
}

/// Retry queue and polling fallback.
pub struct BackgroundSync {
    config: BackgroundConfig,
    queue: VecDeque<QueuedOperation>,
    next_seq: u64,
    polling: bool,
    next_poll_at: Option<Timestamp>,
    manual_poll: Throttle,
    events: Vec<SyncEvent>,
    stats: BackgroundStats,
}

impl BackgroundSync {
    /// Creates a coordinator with an empty queue and polling stopped.
    #[must_use]
    pub fn new(config: BackgroundConfig) -> Self {
        let manual_poll = Throttle::new(Duration::from_millis(config.poll_interval_ms));
        Self {
            config,
            queue: VecDeque::new(),
            next_seq: 0,
            polling: false,
            next_poll_at: None,
            manual_poll,
            events: Vec::new(),
            stats: BackgroundStats::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BackgroundConfig {
        &self.config
    }

    // ── Retry queue ──────────────────────────────────────────────

    /// Queues an operation for delivery as soon as possible.
    ///
    /// If the queue is full, the oldest entry among those with the lowest
    /// priority is dropped and its id returned.
    pub fn enqueue(&mut self, item: UpdateItem, now: Timestamp) -> Option<OperationId> {
        if self.queue.iter().any(|q| q.item.id == item.id) {
            debug!("Operation {} already queued", item.id);
            return None;
        }
        self.next_seq += 1;
        let op = QueuedOperation {
            item,
            seq: self.next_seq,
            failures: 0,
            next_attempt_at: now,
        };
        self.insert(op)
    }

    /// Puts an operation back without counting a failure (e.g. its request
    /// was cut off by a disconnect).
    pub fn requeue(&mut self, op: QueuedOperation) -> Option<OperationId> {
        self.insert(op)
    }

    fn insert(&mut self, op: QueuedOperation) -> Option<OperationId> {
        let pos = self.queue.partition_point(|q| q.seq < op.seq);
        self.queue.insert(pos, op);

        if self.queue.len() <= self.config.queue_capacity {
            return None;
        }
        let victim = self
            .queue
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.priority().cmp(&b.priority()).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i)?;
        let dropped = self.queue.remove(victim)?;
        self.stats.dropped += 1;
        warn!(
            "Retry queue full ({}), dropped operation {}",
            self.config.queue_capacity,
            dropped.id()
        );
        self.events.push(SyncEvent::OperationDropped {
            operation_id: dropped.id(),
        });
        Some(dropped.id())
    }

    /// Removes up to `limit` operations whose next attempt is due, in
    /// arrival order.
    pub fn take_ready(&mut self, now: Timestamp, limit: usize) -> Vec<QueuedOperation> {
        let mut ready = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        while let Some(op) = self.queue.pop_front() {
            if ready.len() < limit && op.next_attempt_at <= now {
                ready.push(op);
            } else {
                kept.push_back(op);
            }
        }
        self.queue = kept;
        ready
    }

    /// Records a failed attempt and either schedules a retry or reports the
    /// operation as permanently failed.
    pub fn record_failure(&mut self, mut op: QueuedOperation, now: Timestamp) -> RetryOutcome {
        op.failures += 1;
        if op.failures >= self.config.retry_attempts {
            self.stats.failed += 1;
            error!(
                "Operation {} failed after {} attempts",
                op.id(),
                op.failures
            );
            self.events.push(SyncEvent::SyncFailed {
                operation_id: op.id(),
                attempts: op.failures,
            });
            return RetryOutcome::Failed {
                attempts: op.failures,
            };
        }

        let delay = backoff_delay(
            self.config.retry_delay_ms,
            self.config.retry_multiplier,
            op.failures - 1,
            u64::MAX,
        );
        op.next_attempt_at = now.add_millis(delay);
        self.stats.retried += 1;
        debug!(
            "Retrying operation {} in {}ms (failure {})",
            op.id(),
            delay,
            op.failures
        );
        let outcome = RetryOutcome::Scheduled {
            at: op.next_attempt_at,
            failures: op.failures,
        };
        self.insert(op);
        outcome
    }

    /// Drops a queued operation without reporting it.
    pub fn remove(&mut self, operation_id: OperationId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.id() != operation_id);
        self.queue.len() != before
    }

    /// Earliest time a queued operation becomes due.
    #[must_use]
    pub fn next_retry_at(&self) -> Option<Timestamp> {
        self.queue.iter().map(|q| q.next_attempt_at).min()
    }

    /// Whether any queued operation is due at `now`.
    #[must_use]
    pub fn has_ready(&self, now: Timestamp) -> bool {
        self.queue.iter().any(|q| q.next_attempt_at <= now)
    }

    /// Queued operations in arrival order.
    pub fn queued(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.queue.iter()
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Empties the queue, returning what was in it.
    pub fn clear(&mut self) -> Vec<QueuedOperation> {
        self.queue.drain(..).collect()
    }

    // ── Polling ──────────────────────────────────────────────────

    /// Starts the polling fallback; the first poll is due immediately.
    pub fn start_polling(&mut self, now: Timestamp) {
        if self.polling {
            return;
        }
        info!(
            "Starting fallback polling every {}ms",
            self.config.poll_interval_ms
        );
        self.polling = true;
        self.next_poll_at = Some(now);
    }

    /// Stops the polling fallback.
    pub fn stop_polling(&mut self) {
        if self.polling {
            info!("Stopping fallback polling");
        }
        self.polling = false;
        self.next_poll_at = None;
    }

    /// Whether the polling fallback is active.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// When the next scheduled poll is due.
    #[must_use]
    pub fn next_poll_at(&self) -> Option<Timestamp> {
        self.next_poll_at
    }

    /// Returns true (and schedules the following poll) if a poll is due.
    pub fn poll_due(&mut self, now: Timestamp) -> bool {
        match self.next_poll_at {
            Some(at) if self.polling && at <= now => {
                self.next_poll_at = Some(now.add_millis(self.config.poll_interval_ms));
                self.stats.polls += 1;
                true
            }
            _ => false,
        }
    }

    /// Manual refresh. At most one is allowed per poll interval; returns
    /// whether the poll should run.
    pub fn request_poll(&mut self, now: Timestamp) -> bool {
        if !self.manual_poll.try_fire(now) {
            debug!("Manual poll throttled");
            return false;
        }
        if self.polling {
            self.next_poll_at = Some(now.add_millis(self.config.poll_interval_ms));
        }
        self.stats.polls += 1;
        true
    }

    // ── Reporting ────────────────────────────────────────────────

    /// Takes the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Returns activity counters.
    #[must_use]
    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            queued: self.queue.len(),
            polling: self.polling,
            ..self.stats.clone()
        }
    }
}
