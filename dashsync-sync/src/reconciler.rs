//! Optimistic state reconciler.
//!
//! Local mutations are written to the view immediately and tracked as
//! [`PendingOperation`]s until the server confirms, rejects or silently
//! drops them. The view value of a key is always rebuilt as
//!
//! ```text
//! confirmed value ⊕ still-pending local operations (submission order)
//! ```
//!
//! so a rollback is just "remove the operation and rebuild", and a confirm
//! replaces whatever the view had drifted to with the confirmed value.
//!
//! Remote updates for a key with unconfirmed local operations are conflicts
//! and are routed to the configured [`ConflictStrategy`].

use crate::config::{ConflictStrategy, ReconcilerConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use dashsync_types::{
    into_fields, merge_fields, ConflictId, Fields, OperationId, Timestamp, UpdateItem, UpdateKey,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Lifecycle of an optimistic operation. Transitions only leave `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Confirmed,
    Conflicted,
    Expired,
    Rejected,
}

impl OperationStatus {
    /// Whether the operation has settled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One optimistic local mutation awaiting the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub operation_id: OperationId,
    pub item: UpdateItem,
    pub submitted_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: OperationStatus,
}

/// A remote update that collided with unconfirmed local operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub id: ConflictId,
    pub key: UpdateKey,
    /// Strategy in force when the conflict was detected.
    pub strategy: ConflictStrategy,
    /// The local operations involved.
    pub operation_ids: Vec<OperationId>,
    /// View value of the key when the conflict was detected.
    pub local: Option<Fields>,
    /// The remote update (later remote updates to the key are merged in
    /// while a manual conflict is open).
    pub remote: UpdateItem,
    pub detected_at: Timestamp,
    /// Manual conflicts stay unresolved until the caller decides.
    pub resolved: bool,
}

/// Caller decision for a manual conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local value and send it to the server again.
    KeepLocal,
    /// Accept the remote value.
    TakeRemote,
    /// Replace both with a merged value and send it to the server.
    Custom(Fields),
}

/// What [`OptimisticReconciler::reconcile_incoming`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No local operation was in the way; the update was applied.
    Applied,
    /// The update echoed a pending local operation and confirmed it.
    Confirmed(OperationId),
    /// The update echoed an operation that was already confirmed; ignored.
    Duplicate,
    /// The update collided with pending local operations.
    Conflict(ConflictId),
    /// The key has an open manual conflict; the update was folded into it.
    Held(ConflictId),
}

/// The UI state store the reconciler writes into.
pub trait ViewStore: Send {
    /// Current value of a key.
    fn get(&self, key: &UpdateKey) -> Option<Fields>;

    /// Replaces the value of a key.
    fn set(&mut self, key: &UpdateKey, value: Fields);

    /// Removes a key.
    fn remove(&mut self, key: &UpdateKey);
}

/// In-memory [`ViewStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryViewStore {
    values: HashMap<UpdateKey, Fields>,
}

impl MemoryViewStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows the value of a key.
    #[must_use]
    pub fn value(&self, key: &UpdateKey) -> Option<&Fields> {
        self.values.get(key)
    }

    /// All stored values.
    #[must_use]
    pub fn values(&self) -> &HashMap<UpdateKey, Fields> {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ViewStore for MemoryViewStore {
    fn get(&self, key: &UpdateKey) -> Option<Fields> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &UpdateKey, value: Fields) {
        self.values.insert(key.clone(), value);
    }

    fn remove(&mut self, key: &UpdateKey) {
        self.values.remove(key);
    }
}

/// Snapshot for a sync-status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Operations awaiting the server.
    pub pending_count: usize,
    /// Manual conflicts awaiting a decision.
    pub conflict_count: usize,
    /// Last time confirmed state changed.
    pub last_synced_at: Option<Timestamp>,
    /// Nothing pending and nothing in conflict.
    pub is_synced: bool,
}

/// Applies an update to a value: snapshots replace, everything else merges.
fn apply_item(base: &mut Fields, item: &UpdateItem) {
    if item.payload.is_snapshot() {
        *base = item.payload.fields().clone();
    } else {
        merge_fields(base, item.payload.fields());
    }
}

/// Tracks optimistic operations and keeps the view consistent with them.
pub struct OptimisticReconciler<S: ViewStore = MemoryViewStore> {
    config: ReconcilerConfig,
    store: S,
    confirmed: HashMap<UpdateKey, Fields>,
    operations: HashMap<OperationId, PendingOperation>,
    /// Pending operation ids per key, in submission order.
    pending_by_key: HashMap<UpdateKey, Vec<OperationId>>,
    /// Bounded memory of settled operations, for duplicate detection.
    settled: HashMap<OperationId, OperationStatus>,
    settled_order: VecDeque<OperationId>,
    conflicts: BTreeMap<ConflictId, Conflict>,
    /// Remote updates held back under `LocalWins`.
    held: HashMap<UpdateKey, UpdateItem>,
    events: Vec<SyncEvent>,
    last_synced_at: Option<Timestamp>,
    last_sweep_at: Option<Timestamp>,
}

impl OptimisticReconciler<MemoryViewStore> {
    /// Creates a reconciler writing into an in-memory view.
    #[must_use]
    pub fn new(config: ReconcilerConfig) -> Self {
        Self::with_store(config, MemoryViewStore::new())
    }
}

impl<S: ViewStore> OptimisticReconciler<S> {
    /// Creates a reconciler writing into `store`.
    pub fn with_store(config: ReconcilerConfig, store: S) -> Self {
        Self {
            config,
            store,
            confirmed: HashMap::new(),
            operations: HashMap::new(),
            pending_by_key: HashMap::new(),
            settled: HashMap::new(),
            settled_order: VecDeque::new(),
            conflicts: BTreeMap::new(),
            held: HashMap::new(),
            events: Vec::new(),
            last_synced_at: None,
            last_sweep_at: None,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Changes the conflict strategy for conflicts detected from now on.
    pub fn set_conflict_strategy(&mut self, strategy: ConflictStrategy) {
        self.config.conflict_strategy = strategy;
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // ── Local operations ─────────────────────────────────────────

    /// Writes a local mutation to the view and starts tracking it.
    ///
    /// The returned id is the item id; forwarding the item to the server is
    /// the caller's job.
    pub fn apply_optimistic(&mut self, item: UpdateItem, now: Timestamp) -> OperationId {
        let id = item.id;
        if self.operations.contains_key(&id) || self.settled.contains_key(&id) {
            debug!("Operation {} already tracked", id);
            return id;
        }
        let key = item.key();
        let op = PendingOperation {
            operation_id: id,
            submitted_at: now,
            expires_at: now.add_millis(self.config.optimistic_timeout_ms),
            status: OperationStatus::Pending,
            item,
        };
        self.operations.insert(id, op);
        self.pending_by_key.entry(key.clone()).or_default().push(id);
        debug!("Applied optimistic operation {} on {}", id, key);
        self.rebuild(&key);
        id
    }

    /// The server applied an operation.
    ///
    /// Older pending operations on the same key are confirmed with it (their
    /// data travelled in the same merged item). `remote` carries the server's
    /// value of the touched fields when it differs from what was sent.
    /// Re-delivered acks are ignored. Returns whether anything changed.
    pub fn confirm(
        &mut self,
        operation_id: OperationId,
        remote: Option<Value>,
        now: Timestamp,
    ) -> bool {
        if let Some(status) = self.settled.get(&operation_id) {
            debug!("Duplicate ack for {} ({:?})", operation_id, status);
            return false;
        }
        let Some(op) = self.operations.get(&operation_id) else {
            warn!("Ack for unknown operation {}", operation_id);
            return false;
        };
        let key = op.item.key();
        let snapshot = op.item.payload.is_snapshot();

        let mut value = self.confirmed.get(&key).cloned().unwrap_or_default();
        let mut confirmed_through = Timestamp::ZERO;
        for id in self.pending_through(&key, operation_id) {
            if let Some(op) = self.settle(id, OperationStatus::Confirmed) {
                apply_item(&mut value, &op.item);
                confirmed_through = confirmed_through.max(op.item.timestamp);
                self.events.push(SyncEvent::OperationConfirmed { operation_id: id });
            }
        }
        if let Some(data) = remote {
            let fields = into_fields(data);
            if snapshot {
                value = fields;
            } else {
                merge_fields(&mut value, &fields);
            }
        }
        if let Some(held) = self.held.remove(&key) {
            if held.timestamp > confirmed_through {
                debug!("Applying held remote update on {}", key);
                apply_item(&mut value, &held);
            } else {
                debug!("Held remote update on {} is older than the confirmed value", key);
            }
        }

        self.confirmed.insert(key.clone(), value);
        self.last_synced_at = Some(now);
        debug!("Confirmed operation {} on {}", operation_id, key);
        self.rebuild(&key);
        true
    }

    /// The server refused an operation; it (and older pending operations on
    /// the same key) is rolled back and reported once.
    pub fn reject(&mut self, operation_id: OperationId, reason: &str) -> bool {
        if self.settled.contains_key(&operation_id) {
            debug!("Duplicate rejection for {}", operation_id);
            return false;
        }
        let Some(op) = self.operations.get(&operation_id) else {
            warn!("Rejection for unknown operation {}", operation_id);
            return false;
        };
        let key = op.item.key();
        for id in self.pending_through(&key, operation_id) {
            if self.settle(id, OperationStatus::Rejected).is_some() {
                warn!("Operation {} rejected: {}", id, reason);
                self.events.push(SyncEvent::OperationRejected {
                    operation_id: id,
                    reason: reason.to_string(),
                });
            }
        }
        self.release_held(&key);
        self.rebuild(&key);
        true
    }

    // ── Remote updates ───────────────────────────────────────────

    /// Reconciles an update pushed or polled from the server.
    pub fn reconcile_incoming(&mut self, remote: UpdateItem, now: Timestamp) -> ReconcileOutcome {
        let id = remote.id;
        if self.settled.get(&id) == Some(&OperationStatus::Confirmed) {
            debug!("Ignoring echo of confirmed operation {}", id);
            return ReconcileOutcome::Duplicate;
        }
        if self.operations.contains_key(&id) {
            let data = Value::Object(remote.payload.fields().clone());
            self.confirm(id, Some(data), now);
            return ReconcileOutcome::Confirmed(id);
        }

        let key = remote.key();
        if let Some(conflict) = self
            .conflicts
            .values_mut()
            .find(|c| !c.resolved && c.key == key)
        {
            debug!("Holding remote update on {} behind conflict {}", key, conflict.id);
            conflict.remote.merge(&remote);
            return ReconcileOutcome::Held(conflict.id);
        }

        let pending = self.pending_by_key.get(&key).cloned().unwrap_or_default();
        if pending.is_empty() {
            apply_item(self.confirmed.entry(key.clone()).or_default(), &remote);
            self.last_synced_at = Some(now);
            self.rebuild(&key);
            return ReconcileOutcome::Applied;
        }

        let strategy = self.config.conflict_strategy;
        let mut conflict = Conflict {
            id: ConflictId::new(),
            key: key.clone(),
            strategy,
            operation_ids: pending.clone(),
            local: self.store.get(&key),
            remote: remote.clone(),
            detected_at: now,
            resolved: strategy != ConflictStrategy::Manual,
        };
        info!(
            "Conflict {} on {} ({} pending), strategy {:?}",
            conflict.id,
            key,
            pending.len(),
            strategy
        );

        match strategy {
            ConflictStrategy::RemoteWins => {
                for op_id in &pending {
                    self.settle(*op_id, OperationStatus::Conflicted);
                }
                apply_item(self.confirmed.entry(key.clone()).or_default(), &remote);
                self.last_synced_at = Some(now);
            }
            ConflictStrategy::LocalWins => match self.held.get_mut(&key) {
                Some(held) => held.merge(&remote),
                None => {
                    self.held.insert(key.clone(), remote);
                }
            },
            ConflictStrategy::Manual => {
                for op_id in &pending {
                    self.settle(*op_id, OperationStatus::Conflicted);
                }
                // The view keeps showing the local value until resolved.
                conflict.local = conflict.local.or_else(|| Some(Fields::new()));
            }
        }

        let conflict_id = conflict.id;
        self.events.push(SyncEvent::ConflictDetected(conflict.clone()));
        self.conflicts.insert(conflict_id, conflict);
        self.rebuild(&key);
        ReconcileOutcome::Conflict(conflict_id)
    }

    /// Settles an open manual conflict.
    ///
    /// The remote value becomes the confirmed base. For `KeepLocal` and
    /// `Custom` the chosen value is applied as a new optimistic operation,
    /// which is returned so the caller can send it.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        resolution: Resolution,
        now: Timestamp,
    ) -> SyncResult<Option<UpdateItem>> {
        let Some(conflict) = self.conflicts.get_mut(&conflict_id) else {
            return Err(SyncError::Conflict {
                key: format!("unknown conflict {conflict_id}"),
            });
        };
        if conflict.resolved {
            return Err(SyncError::Conflict {
                key: conflict.key.to_string(),
            });
        }
        conflict.resolved = true;
        let key = conflict.key.clone();
        let remote = conflict.remote.clone();
        let local = conflict.local.clone();

        apply_item(self.confirmed.entry(key.clone()).or_default(), &remote);
        self.last_synced_at = Some(now);

        let chosen = match resolution {
            Resolution::TakeRemote => None,
            Resolution::KeepLocal => local,
            Resolution::Custom(fields) => Some(fields),
        };
        info!("Conflict {} on {} resolved", conflict_id, key);

        let Some(fields) = chosen else {
            self.rebuild(&key);
            return Ok(None);
        };
        let mut payload = remote.payload.clone();
        if payload.is_snapshot() {
            *payload.fields_mut() = fields;
        } else {
            merge_fields(payload.fields_mut(), &fields);
        }
        let item = UpdateItem::at(payload, now);
        self.apply_optimistic(item.clone(), now);
        Ok(Some(item))
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Earliest time [`sweep`](Self::sweep) has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let retention = self.config.conflict_retention_ms;
        let due = [
            self.operations.values().map(|op| op.expires_at).min(),
            self.conflicts
                .values()
                .map(|c| c.detected_at.add_millis(retention))
                .min(),
        ]
        .into_iter()
        .flatten()
        .min()?;
        Some(match self.last_sweep_at {
            Some(last) => due.max(last.add_millis(self.config.sweep_interval_ms)),
            None => due,
        })
    }

    /// Expires overdue operations and ages out conflicts.
    ///
    /// Each expired operation is rolled back and reported once. An unresolved
    /// manual conflict that outlives the retention window is resolved in
    /// favour of the server and reported once. Returns the number of expired
    /// operations.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        self.last_sweep_at = Some(now);

        let mut overdue: Vec<(Timestamp, OperationId)> = self
            .operations
            .values()
            .filter(|op| op.expires_at <= now)
            .map(|op| (op.expires_at, op.operation_id))
            .collect();
        overdue.sort();
        let expired = self.expire(overdue.into_iter().map(|(_, id)| id));

        let retention = self.config.conflict_retention_ms;
        let stale: Vec<ConflictId> = self
            .conflicts
            .values()
            .filter(|c| c.detected_at.add_millis(retention) <= now)
            .map(|c| c.id)
            .collect();
        for conflict_id in stale {
            let Some(conflict) = self.conflicts.remove(&conflict_id) else {
                continue;
            };
            if conflict.resolved {
                continue;
            }
            warn!(
                "Conflict {} on {} unresolved after {}ms, taking the remote value",
                conflict.id, conflict.key, retention
            );
            apply_item(
                self.confirmed.entry(conflict.key.clone()).or_default(),
                &conflict.remote,
            );
            self.rebuild(&conflict.key);
            self.events.push(SyncEvent::ConflictUnresolved {
                conflict_id: conflict.id,
                key: conflict.key,
            });
        }

        expired
    }

    /// Expires every pending operation (teardown).
    pub fn expire_all(&mut self) -> usize {
        let mut all: Vec<(Timestamp, OperationId)> = self
            .operations
            .values()
            .map(|op| (op.submitted_at, op.operation_id))
            .collect();
        all.sort();
        self.expire(all.into_iter().map(|(_, id)| id))
    }

    fn expire(&mut self, ids: impl Iterator<Item = OperationId>) -> usize {
        let mut touched = BTreeSet::new();
        let mut count = 0;
        for id in ids {
            if let Some(op) = self.settle(id, OperationStatus::Expired) {
                let key = op.item.key();
                warn!("Operation {} on {} expired unacknowledged", id, key);
                self.events.push(SyncEvent::OperationExpired {
                    operation_id: id,
                    key: key.clone(),
                });
                touched.insert(key);
                count += 1;
            }
        }
        for key in touched {
            self.release_held(&key);
            self.rebuild(&key);
        }
        count
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Status of an operation, live or recently settled.
    #[must_use]
    pub fn status(&self, operation_id: OperationId) -> Option<OperationStatus> {
        self.operations
            .get(&operation_id)
            .map(|op| op.status)
            .or_else(|| self.settled.get(&operation_id).copied())
    }

    /// A still-pending operation.
    #[must_use]
    pub fn operation(&self, operation_id: OperationId) -> Option<&PendingOperation> {
        self.operations.get(&operation_id)
    }

    /// Number of pending operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Whether a key has pending operations.
    #[must_use]
    pub fn has_pending(&self, key: &UpdateKey) -> bool {
        self.pending_by_key.get(key).is_some_and(|ids| !ids.is_empty())
    }

    /// Retained conflicts, oldest first.
    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values()
    }

    #[must_use]
    pub fn conflict(&self, conflict_id: ConflictId) -> Option<&Conflict> {
        self.conflicts.get(&conflict_id)
    }

    /// Last confirmed value of a key.
    #[must_use]
    pub fn confirmed_value(&self, key: &UpdateKey) -> Option<&Fields> {
        self.confirmed.get(key)
    }

    /// Current view value of a key.
    #[must_use]
    pub fn view(&self, key: &UpdateKey) -> Option<Fields> {
        self.store.get(key)
    }

    /// Snapshot for a sync-status indicator.
    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        let conflict_count = self.conflicts.values().filter(|c| !c.resolved).count();
        let pending_count = self.operations.len();
        SyncStatus {
            pending_count,
            conflict_count,
            last_synced_at: self.last_synced_at,
            is_synced: pending_count == 0 && conflict_count == 0,
        }
    }

    /// Takes the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Internals ────────────────────────────────────────────────

    /// Pending ids on `key` up to and including `operation_id`.
    fn pending_through(&self, key: &UpdateKey, operation_id: OperationId) -> Vec<OperationId> {
        let Some(ids) = self.pending_by_key.get(key) else {
            return Vec::new();
        };
        match ids.iter().position(|id| *id == operation_id) {
            Some(pos) => ids[..=pos].to_vec(),
            None => Vec::new(),
        }
    }

    /// Moves a pending operation to a terminal status.
    fn settle(
        &mut self,
        operation_id: OperationId,
        status: OperationStatus,
    ) -> Option<PendingOperation> {
        let mut op = self.operations.remove(&operation_id)?;
        op.status = status;
        let key = op.item.key();
        if let Some(ids) = self.pending_by_key.get_mut(&key) {
            ids.retain(|id| *id != operation_id);
            if ids.is_empty() {
                self.pending_by_key.remove(&key);
            }
        }
        self.settled.insert(operation_id, status);
        self.settled_order.push_back(operation_id);
        while self.settled_order.len() > self.config.settled_history.max(1) {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
        Some(op)
    }

    /// Applies a held `LocalWins` remote update once no local operation on
    /// the key is left to confirm.
    fn release_held(&mut self, key: &UpdateKey) {
        if self.has_pending(key) {
            return;
        }
        if let Some(held) = self.held.remove(key) {
            debug!("Releasing held remote update on {}", key);
            apply_item(self.confirmed.entry(key.clone()).or_default(), &held);
        }
    }

    /// Rewrites the view value of `key` from confirmed state and pending
    /// operations.
    fn rebuild(&mut self, key: &UpdateKey) {
        let overlay = self
            .conflicts
            .values()
            .find(|c| !c.resolved && c.key == *key)
            .and_then(|c| c.local.clone());
        let mut value = overlay.or_else(|| self.confirmed.get(key).cloned());

        if let Some(ids) = self.pending_by_key.get(key) {
            for id in ids {
                if let Some(op) = self.operations.get(id) {
                    apply_item(value.get_or_insert_with(Fields::new), &op.item);
                }
            }
        }

        let before = self.store.get(key);
        if before == value {
            return;
        }
        match value {
            Some(value) => self.store.set(key, value),
            None => self.store.remove(key),
        }
        self.events.push(SyncEvent::StateChanged {
            keys: vec![key.clone()],
        });
    }
}
