//! Error types for the sync layer.
//!
//! Transient failures (`Connection`, `Http`, `WebSocket`, `Timeout`) are
//! retried internally and never reach the UI. Terminal failures are surfaced
//! once as a [`SyncEvent`](crate::SyncEvent); the error values here are what
//! components return at their boundaries.

use dashsync_types::OperationId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient transport failure; triggers a reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// Reconnect attempts exhausted.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionExhausted { attempts: u32 },

    /// A batch handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A local pending operation collided with a remote update.
    #[error("conflict on {key}")]
    Conflict { key: String },

    /// An optimistic operation was not acknowledged in time.
    #[error("operation {operation_id} timed out")]
    OperationTimeout { operation_id: OperationId },

    /// A queued background operation exhausted its retries.
    #[error("sync of {operation_id} failed after {attempts} attempts")]
    SyncFailure {
        operation_id: OperationId,
        attempts: u32,
    },

    /// Unknown or invalid wire message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Update payload could not be interpreted.
    #[error("invalid update: {0}")]
    Update(#[from] dashsync_types::Error),

    /// HTTP transport or backend error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The persistence layer reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether the error is worth retrying under the backoff policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Http(_) | Self::WebSocket(_) | Self::Timeout
        )
    }
}

/// Failure reported by a batch handler.
///
/// Handler failures are caught and logged by the processor; they never stop
/// other handlers or later batches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler failed: {message}")]
pub struct HandlerError {
    /// What went wrong.
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
