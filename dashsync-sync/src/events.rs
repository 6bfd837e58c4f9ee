//! Subscriber registry and the events surfaced to the UI.

use crate::connection::ConnectionStatus;
use crate::protocol::MessageType;
use crate::reconciler::Conflict;
use dashsync_types::{ConflictId, OperationId, UpdateKey};
use serde_json::Value;
use std::fmt;

/// Handle returned by a subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An ordered set of callbacks.
pub struct Listeners<T: ?Sized> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Box<T>)>,
}

impl<T: ?Sized> Listeners<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Registers a callback; callbacks run in registration order.
    pub fn add(&mut self, listener: Box<T>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, listener));
        id
    }

    /// Unregisters a callback. Returns false if it was not registered.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Iterates callbacks mutably in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SubscriptionId, &mut T)> {
        self.entries.iter_mut().map(|(id, listener)| (*id, &mut **listener))
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every callback.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the UI may want to show.
///
/// Terminal failures (`ConnectionExhausted`, `OperationExpired`,
/// `OperationRejected`, `SyncFailed`, `ConflictUnresolved`) are emitted
/// exactly once per occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The push connection changed state.
    ConnectionChanged {
        status: ConnectionStatus,
        attempt: u32,
    },
    /// Reconnecting gave up.
    ConnectionExhausted { attempts: u32 },
    /// View state for these keys changed.
    StateChanged { keys: Vec<UpdateKey> },
    /// The server confirmed an optimistic operation.
    OperationConfirmed { operation_id: OperationId },
    /// An optimistic operation was not acknowledged in time and was rolled back.
    OperationExpired {
        operation_id: OperationId,
        key: UpdateKey,
    },
    /// The server rejected an optimistic operation; it was rolled back.
    OperationRejected {
        operation_id: OperationId,
        reason: String,
    },
    /// A remote update collided with a pending local operation.
    ConflictDetected(Conflict),
    /// A manual conflict outlived its retention window and was resolved in
    /// favour of the server.
    ConflictUnresolved {
        conflict_id: ConflictId,
        key: UpdateKey,
    },
    /// A queued background operation exhausted its retries.
    SyncFailed {
        operation_id: OperationId,
        attempts: u32,
    },
    /// The retry queue was full and dropped an operation.
    OperationDropped { operation_id: OperationId },
    /// The server reported an error.
    ServerError { code: String, message: String },
    /// `SERVER_INFO`, or a `SERVER_BROADCAST` that carries no updates.
    ServerNotice {
        message_type: MessageType,
        payload: Value,
    },
}

impl SyncEvent {
    /// Whether this event reports a terminal failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionExhausted { .. }
                | Self::OperationExpired { .. }
                | Self::OperationRejected { .. }
                | Self::ConflictUnresolved { .. }
                | Self::SyncFailed { .. }
                | Self::OperationDropped { .. }
        )
    }
}
