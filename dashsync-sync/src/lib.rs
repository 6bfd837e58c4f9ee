//! Real-time state synchronization for multi-device dashboards.
//!
//! Keeps dashboard, widget, layout, theme and preference state consistent
//! between a client and a server, and across the user's devices, while the
//! UI stays responsive under intermittent connectivity.
//!
//! # Architecture
//!
//! Every component is a deadline-driven state machine that takes the current
//! time as an argument and exposes its next deadline. A [`SyncSession`] wires
//! them together without doing I/O; the [`SyncOrchestrator`] owns the
//! transports and timers and drives the session.
//!
//! ## Components
//!
//! - **Processor**: debounces, dedups and prioritizes updates into batches
//! - **Connection**: push connection lifecycle, heartbeat, reconnect backoff
//! - **Reconciler**: optimistic view, confirmation, rollback, conflicts
//! - **Background**: offline retry queue and polling fallback
//! - **Preferences**: cross-device preference changes and device registry
//! - **Transport**: WebSocket push and HTTP polling
//!
//! ## Update flow
//!
//! 1. **Apply**: a UI mutation is shown immediately as a pending operation
//! 2. **Batch**: the processor merges bursts into one request
//! 3. **Send**: the batch goes over the socket, or waits in the retry queue
//! 4. **Reconcile**: acks confirm, timeouts roll back, remote updates merge
//!
//! # Example
//!
//! ```
//! use dashsync_sync::{ManualClock, SyncConfig, SyncSession};
//! use dashsync_types::{Timestamp, UpdateItem, UpdatePayload};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let clock = ManualClock::new(Timestamp::from_millis(1_000));
//! let mut session = SyncSession::new(SyncConfig::default(), Arc::new(clock)).unwrap();
//!
//! let item = UpdateItem::new(UpdatePayload::theme(json!({ "mode": "dark" })));
//! let key = item.key();
//! session.submit(item);
//! assert_eq!(session.view(&key).unwrap()["mode"], "dark");
//! ```

pub mod background;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connection;
pub mod devices;
mod engine;
mod error;
pub mod events;
pub mod facade;
mod orchestrator;
pub mod preferences;
pub mod processor;
pub mod protocol;
pub mod reconciler;
pub mod schedule;
pub mod transport;

pub use background::{BackgroundStats, BackgroundSync, QueuedOperation, RetryOutcome};
pub use cache::{CacheKey, CacheKind, TtlCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use config::{
    BackgroundConfig, BatchConfig, CacheConfig, ConflictStrategy, ConnectionConfig,
    ReconcilerConfig, SyncConfig,
};
pub use connection::{ConnectionAction, ConnectionManager, ConnectionState, ConnectionStatus};
pub use devices::DeviceRegistry;
pub use engine::{EventListener, MessageListener, SessionAction, SessionSnapshot, SyncSession};
pub use error::{HandlerError, SyncError, SyncResult};
pub use events::{SubscriptionId, SyncEvent};
pub use facade::{
    DashboardFacade, IndicatorState, NotificationFacade, SyncStatusIndicator, UpdateSink,
    WidgetPosition,
};
pub use orchestrator::{
    create_orchestrator, create_orchestrator_with_session, OrchestratorHandle, SyncCommand,
    SyncOrchestrator,
};
pub use preferences::{
    HttpPreferenceBackend, MemoryPreferenceBackend, PreferenceBackend, PreferenceSync, SyncReport,
    HISTORY_LIMIT,
};
pub use processor::{ProcessorStats, UpdateProcessor};
pub use protocol::{MessageType, WireMessage};
pub use reconciler::{
    Conflict, MemoryViewStore, OperationStatus, OptimisticReconciler, ReconcileOutcome,
    Resolution, SyncStatus, ViewStore,
};
pub use transport::{HttpPollTransport, Transport, TransportEvent, TransportKind, WebSocketTransport};
