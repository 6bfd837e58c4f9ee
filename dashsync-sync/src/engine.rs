//! Sync session: stateful sync logic without I/O.
//!
//! A [`SyncSession`] is the per-session context that owns every component
//! and wires them together. It is a pure state machine: the I/O driver feeds
//! it transport events and the passage of time, and carries out the
//! [`SessionAction`]s it produces. The orchestrator is one such driver;
//! tests can drive a session directly with a [`ManualClock`](crate::ManualClock).
//!
//! Data flow:
//!
//! ```text
//! submit ─▶ reconciler (optimistic) ─▶ outbound processor ─▶ SYNC_BATCH ─▶ push transport
//!                                                    └─(not open)─▶ retry queue
//! push / poll frame ─▶ inbound processor ─▶ reconciler ─▶ view
//! ```

use crate::background::{BackgroundStats, BackgroundSync, QueuedOperation};
use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::config::{ConflictStrategy, SyncConfig};
use crate::connection::{ConnectionAction, ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error::SyncResult;
use crate::events::{Listeners, SubscriptionId, SyncEvent};
use crate::processor::{ProcessorStats, UpdateProcessor};
use crate::protocol::{AckPayload, MessageType, ServerErrorPayload, WireMessage};
use crate::reconciler::{
    MemoryViewStore, OptimisticReconciler, Resolution, SyncStatus, ViewStore,
};
use dashsync_types::{
    BatchId, BatchUpdate, ConflictId, Fields, OperationId, Timestamp, UpdateItem, UpdateKey,
};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

/// Callback receiving every surfaced event.
pub type EventListener = dyn FnMut(&SyncEvent) + Send;

/// Callback receiving inbound wire messages of one type.
pub type MessageListener = dyn FnMut(&WireMessage) + Send;

/// I/O the session needs performed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Open the push transport.
    Dial,
    /// Send a message over the push transport.
    Send(WireMessage),
    /// Close the push transport.
    ForceClose,
    /// Fetch once from the polling transport.
    Poll,
}

/// Point-in-time view of a session for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub sync: SyncStatus,
    pub outbound: ProcessorStats,
    pub inbound: ProcessorStats,
    pub background: BackgroundStats,
}

/// The per-session sync context.
pub struct SyncSession<S: ViewStore = MemoryViewStore> {
    config: SyncConfig,
    clock: SharedClock,
    /// Local mutations on their way to the server.
    outbound: UpdateProcessor,
    /// Remote updates on their way to the view.
    inbound: UpdateProcessor,
    connection: ConnectionManager,
    reconciler: OptimisticReconciler<S>,
    background: BackgroundSync,
    cache: TtlCache<Value>,
    actions: Vec<SessionAction>,
    pending_events: Vec<SyncEvent>,
    events: Vec<SyncEvent>,
    listeners: Listeners<EventListener>,
    message_listeners: Listeners<MessageListener>,
}

impl SyncSession<MemoryViewStore> {
    /// Creates a session with an in-memory view.
    pub fn new(config: SyncConfig, clock: SharedClock) -> SyncResult<Self> {
        Self::with_store(config, clock, MemoryViewStore::new())
    }
}

impl<S: ViewStore> SyncSession<S> {
    /// Creates a session writing view state into `store`.
    pub fn with_store(config: SyncConfig, clock: SharedClock, store: S) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            outbound: UpdateProcessor::new(config.batch.clone()),
            inbound: UpdateProcessor::new(config.batch.clone()),
            connection: ConnectionManager::new(config.connection.clone()),
            reconciler: OptimisticReconciler::with_store(config.reconciler.clone(), store),
            background: BackgroundSync::new(config.background.clone()),
            cache: TtlCache::new(config.cache.clone()),
            config,
            clock,
            actions: Vec::new(),
            pending_events: Vec::new(),
            events: Vec::new(),
            listeners: Listeners::new(),
            message_listeners: Listeners::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current time according to the session clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts connecting; polling covers the gap until the socket opens.
    pub fn start(&mut self) {
        let now = self.now();
        let actions = self.connection.connect();
        self.apply_connection_actions(actions, now);
        self.collect_events();
    }

    /// Flushes queued work, closes the connection and expires every
    /// outstanding operation.
    pub fn shutdown(&mut self) {
        let now = self.now();
        info!("Shutting down sync session");
        self.flush_at(now);
        let actions = self.connection.disconnect();
        self.apply_connection_actions(actions, now);
        self.background.stop_polling();
        self.reconciler.expire_all();
        self.outbound.clear();
        self.inbound.clear();
        self.collect_events();
    }

    // ── Local mutations ──────────────────────────────────────────

    /// Applies a local mutation optimistically and queues it for the server.
    pub fn submit(&mut self, item: UpdateItem) -> OperationId {
        let now = self.now();
        let id = self.reconciler.apply_optimistic(item.clone(), now);
        self.outbound.add(item, now);
        self.collect_events();
        id
    }

    /// Settles a manual conflict; a kept or custom value is sent again.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> SyncResult<()> {
        let now = self.now();
        let resubmit = self
            .reconciler
            .resolve_conflict(conflict_id, resolution, now);
        let outcome = match resubmit {
            Ok(Some(item)) => {
                self.outbound.add(item, now);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.collect_events();
        outcome
    }

    /// Manual refresh; throttled to one poll per poll interval.
    pub fn request_poll(&mut self) -> bool {
        let now = self.now();
        if self.background.request_poll(now) {
            self.actions.push(SessionAction::Poll);
            true
        } else {
            false
        }
    }

    /// Synchronously drains both processors.
    pub fn flush(&mut self) {
        let now = self.now();
        self.flush_at(now);
        self.collect_events();
    }

    fn flush_at(&mut self, now: Timestamp) {
        for batch in self.outbound.flush(now) {
            self.route_outbound(batch, now);
        }
        for batch in self.inbound.flush(now) {
            self.route_inbound(batch, now);
        }
    }

    // ── Transport events ─────────────────────────────────────────

    /// The push transport opened.
    pub fn on_transport_open(&mut self) {
        let now = self.now();
        let actions = self.connection.on_open(now);
        self.apply_connection_actions(actions, now);
        self.drain_retry_queue(now);
        self.collect_events();
    }

    /// The push transport closed, failed to open, or failed to send.
    pub fn on_transport_closed(&mut self, reason: &str) {
        let now = self.now();
        let actions = self.connection.on_close(now, reason);
        self.apply_connection_actions(actions, now);
        self.collect_events();
    }

    /// A raw frame arrived from either transport.
    ///
    /// Malformed frames are logged and dropped. Message listeners for the
    /// frame's type run after the session has handled it.
    pub fn on_transport_message(&mut self, frame: &str) {
        let now = self.now();
        match WireMessage::parse(frame) {
            Ok(message) => {
                self.handle_message(&message, now);
                self.dispatch_message(&message);
            }
            Err(e) => warn!("Dropping message: {}", e),
        }
        self.collect_events();
    }

    fn handle_message(&mut self, message: &WireMessage, now: Timestamp) {
        match message.message_type {
            MessageType::Ping => {
                self.connection.on_pong(now);
                self.actions.push(SessionAction::Send(WireMessage::pong(now)));
            }
            MessageType::Pong => self.connection.on_pong(now),
            MessageType::Ack => self.handle_ack(message, false, now),
            MessageType::Nack => self.handle_ack(message, true, now),
            MessageType::SyncResponse
            | MessageType::SyncBatch
            | MessageType::DashboardUpdate
            | MessageType::WidgetUpdate
            | MessageType::LayoutUpdate => self.handle_updates(message, now),
            MessageType::ServerBroadcast => match message.updates() {
                Ok(items) if !items.is_empty() => self.handle_updates(message, now),
                _ => self.notice(message),
            },
            MessageType::ServerError => {
                let payload: ServerErrorPayload =
                    message.payload_as().unwrap_or(ServerErrorPayload {
                        code: String::new(),
                        message: message.payload.to_string(),
                    });
                warn!("Server error {}: {}", payload.code, payload.message);
                self.pending_events.push(SyncEvent::ServerError {
                    code: payload.code,
                    message: payload.message,
                });
            }
            MessageType::ServerInfo => {
                info!("Server info: {}", message.payload);
                self.notice(message);
            }
            MessageType::SyncRequest => {
                debug!("Server requested a resync");
                self.request_poll();
            }
            MessageType::Connect | MessageType::Disconnect => {
                debug!("Ignoring {} from server", message.message_type);
            }
        }
    }

    fn notice(&mut self, message: &WireMessage) {
        self.pending_events.push(SyncEvent::ServerNotice {
            message_type: message.message_type,
            payload: message.payload.clone(),
        });
    }

    fn handle_ack(&mut self, message: &WireMessage, nack: bool, now: Timestamp) {
        let payload = if message.payload.is_null() {
            AckPayload::default()
        } else {
            match message.payload_as::<AckPayload>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping {}: {}", message.message_type, e);
                    return;
                }
            }
        };
        let request = message
            .id
            .as_deref()
            .and_then(|id| self.connection.resolve_request(id));

        let mut listed = HashSet::new();
        for confirmed in payload.confirmed {
            listed.insert(confirmed.id);
            self.reconciler.confirm(confirmed.id, confirmed.data, now);
        }
        for rejected in payload.rejected {
            listed.insert(rejected.id);
            self.reconciler.reject(rejected.id, &rejected.reason);
        }

        let Some(request) = request else {
            return;
        };
        let reason = payload
            .reason
            .unwrap_or_else(|| "rejected by server".to_string());
        for op in request.operations {
            let id = op.id();
            if listed.contains(&id) {
                continue;
            }
            if nack {
                self.reconciler.reject(id, &reason);
            } else {
                self.reconciler.confirm(id, None, now);
            }
        }
    }

    fn handle_updates(&mut self, message: &WireMessage, now: Timestamp) {
        let empty = match &message.payload {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        let items = if empty {
            Vec::new()
        } else {
            match message.updates() {
                Ok(items) => items,
                Err(e) => {
                    warn!("Dropping {}: {}", message.message_type, e);
                    return;
                }
            }
        };

        // A correlated response settles the request it answers: echoed
        // operations are confirmed with the server's data, the rest as sent.
        let request = match message.message_type {
            MessageType::SyncResponse => message
                .id
                .as_deref()
                .and_then(|id| self.connection.resolve_request(id)),
            _ => None,
        };
        let Some(request) = request else {
            self.inbound.add_batch(items, now);
            return;
        };

        let sent: HashSet<OperationId> = request.operations.iter().map(|op| op.id()).collect();
        let mut echoed = HashSet::new();
        for item in items {
            if sent.contains(&item.id) {
                echoed.insert(item.id);
                let data = Value::Object(item.payload.fields().clone());
                self.reconciler.confirm(item.id, Some(data), now);
            } else {
                self.inbound.add(item, now);
            }
        }
        for id in sent.difference(&echoed) {
            self.reconciler.confirm(*id, None, now);
        }
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Earliest time [`poll`](Self::poll) has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let retry = if self.connection.can_send() {
            self.background.next_retry_at()
        } else {
            None
        };
        [
            self.connection.next_deadline(),
            self.outbound.next_deadline(),
            self.inbound.next_deadline(),
            self.reconciler.next_deadline(),
            self.background.next_poll_at(),
            retry,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fires everything due at the current time.
    pub fn poll(&mut self) {
        let now = self.now();

        let actions = self.connection.poll(now);
        self.apply_connection_actions(actions, now);

        while let Some(batch) = self.outbound.poll(now) {
            self.route_outbound(batch, now);
        }
        while let Some(batch) = self.inbound.poll(now) {
            self.route_inbound(batch, now);
        }
        if self.reconciler.next_deadline().is_some_and(|at| at <= now) {
            self.reconciler.sweep(now);
        }
        if self.connection.can_send() {
            self.drain_retry_queue(now);
        }
        if self.background.poll_due(now) {
            self.actions.push(SessionAction::Poll);
        }

        self.collect_events();
    }

    // ── Routing ──────────────────────────────────────────────────

    fn route_outbound(&mut self, batch: BatchUpdate, now: Timestamp) {
        if self.connection.can_send() {
            let ops = batch
                .items
                .into_iter()
                .enumerate()
                .map(|(i, item)| QueuedOperation {
                    item,
                    seq: i as u64,
                    failures: 0,
                    next_attempt_at: now,
                })
                .collect();
            self.send_request(batch.id, ops, now);
        } else {
            debug!(
                "Connection {}, queueing {} operations",
                self.connection.status(),
                batch.items.len()
            );
            for item in batch.items {
                self.background.enqueue(item, now);
            }
        }
    }

    fn route_inbound(&mut self, batch: BatchUpdate, now: Timestamp) {
        for item in batch.items {
            self.cache.invalidate_for(&item);
            self.reconciler.reconcile_incoming(item, now);
        }
    }

    fn send_request(&mut self, request_id: BatchId, ops: Vec<QueuedOperation>, now: Timestamp) {
        let items: Vec<UpdateItem> = ops.iter().map(|op| op.item.clone()).collect();
        let message_id = request_id.to_string();
        match WireMessage::sync_items(message_id.clone(), &items, now) {
            Ok(message) => {
                debug!("Sending {} operations as {}", items.len(), message_id);
                self.connection.track_request(message_id, ops, now);
                self.actions.push(SessionAction::Send(message));
            }
            Err(e) => {
                error!("Could not encode request {}: {}", message_id, e);
                for op in ops {
                    self.background.record_failure(op, now);
                }
            }
        }
    }

    fn drain_retry_queue(&mut self, now: Timestamp) {
        let limit = self.config.batch.batch_size;
        loop {
            let ready = self.background.take_ready(now, limit);
            if ready.is_empty() {
                break;
            }
            self.send_request(BatchId::new(), ready, now);
        }
    }

    fn apply_connection_actions(&mut self, actions: Vec<ConnectionAction>, now: Timestamp) {
        for action in actions {
            match action {
                ConnectionAction::Dial { .. } => self.actions.push(SessionAction::Dial),
                ConnectionAction::Send(message) => self.actions.push(SessionAction::Send(message)),
                ConnectionAction::Close => self.actions.push(SessionAction::ForceClose),
                ConnectionAction::StatusChanged { status, attempt } => {
                    if status == ConnectionStatus::Open {
                        self.background.stop_polling();
                    } else {
                        self.background.start_polling(now);
                    }
                    self.pending_events
                        .push(SyncEvent::ConnectionChanged { status, attempt });
                }
                ConnectionAction::ReconnectScheduled { .. } => {}
                ConnectionAction::Exhausted { attempts } => {
                    self.pending_events
                        .push(SyncEvent::ConnectionExhausted { attempts });
                }
                ConnectionAction::Requeue(requests) => {
                    for request in requests {
                        for op in request.operations {
                            if self.is_live(&op) {
                                self.background.requeue(op);
                            }
                        }
                    }
                }
                ConnectionAction::RequestTimedOut(request) => {
                    for op in request.operations {
                        if self.is_live(&op) {
                            self.background.record_failure(op, now);
                        }
                    }
                }
            }
        }
    }

    /// Operations settled while in flight (expired, rejected, conflicted)
    /// are not delivered again.
    fn is_live(&self, op: &QueuedOperation) -> bool {
        let live = self.reconciler.operation(op.id()).is_some();
        if !live {
            debug!("Not retrying settled operation {}", op.id());
        }
        live
    }

    // ── Events ───────────────────────────────────────────────────

    /// Registers a callback for every surfaced event.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.listeners.add(Box::new(listener))
    }

    /// Unregisters an event callback.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    /// Registers a callback for inbound messages of `message_type`.
    pub fn on_message<F>(&mut self, message_type: MessageType, mut listener: F) -> SubscriptionId
    where
        F: FnMut(&WireMessage) + Send + 'static,
    {
        self.message_listeners
            .add(Box::new(move |message: &WireMessage| {
                if message.message_type == message_type {
                    listener(message);
                }
            }))
    }

    /// Unregisters a message callback.
    pub fn off_message(&mut self, id: SubscriptionId) -> bool {
        self.message_listeners.remove(id)
    }

    fn dispatch_message(&mut self, message: &WireMessage) {
        for (id, listener) in self.message_listeners.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
                error!("Message listener {} panicked on {}", id, message.message_type);
            }
        }
    }

    fn collect_events(&mut self) {
        let mut batch = std::mem::take(&mut self.pending_events);
        batch.extend(self.reconciler.drain_events());
        batch.extend(self.background.drain_events());

        for event in &batch {
            // Expired and conflicted operations are reported and never sent.
            match event {
                SyncEvent::OperationExpired { operation_id, .. } => {
                    self.background.remove(*operation_id);
                }
                SyncEvent::ConflictDetected(conflict)
                    if conflict.strategy != ConflictStrategy::LocalWins =>
                {
                    let dropped = self.outbound.discard(&conflict.operation_ids);
                    for id in &conflict.operation_ids {
                        self.background.remove(*id);
                    }
                    if dropped > 0 {
                        debug!("Dropped {} queued updates lost to {}", dropped, conflict.id);
                    }
                }
                _ => {}
            }
            for (id, listener) in self.listeners.iter_mut() {
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    error!("Event listener {} panicked", id);
                }
            }
        }
        self.events.extend(batch);
    }

    /// Takes the events surfaced since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Takes the I/O actions produced since the last call.
    pub fn take_actions(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.actions)
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Current view value of a key.
    #[must_use]
    pub fn view(&self, key: &UpdateKey) -> Option<Fields> {
        self.reconciler.view(key)
    }

    pub fn reconciler(&self) -> &OptimisticReconciler<S> {
        &self.reconciler
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.reconciler.sync_status()
    }

    pub fn background(&self) -> &BackgroundSync {
        &self.background
    }

    /// The processor carrying local mutations; register handlers here to
    /// observe outgoing batches.
    pub fn outbound_mut(&mut self) -> &mut UpdateProcessor {
        &mut self.outbound
    }

    /// The processor carrying remote updates; register handlers here to
    /// observe incoming batches.
    pub fn inbound_mut(&mut self) -> &mut UpdateProcessor {
        &mut self.inbound
    }

    pub fn cache_mut(&mut self) -> &mut TtlCache<Value> {
        &mut self.cache
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.connection.state(),
            sync: self.reconciler.sync_status(),
            outbound: self.outbound.stats(),
            inbound: self.inbound.stats(),
            background: self.background.stats(),
        }
    }
}
