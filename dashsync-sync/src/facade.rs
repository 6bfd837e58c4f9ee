//! UI-facing facades over the sync loop.

use crate::connection::ConnectionStatus;
use crate::engine::SessionSnapshot;
use crate::error::SyncResult;
use crate::events::SyncEvent;
use crate::orchestrator::OrchestratorHandle;
use async_trait::async_trait;
use dashsync_types::{OperationId, Timestamp, UpdateItem, UpdatePayload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Where facades send local mutations.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn submit(&self, item: UpdateItem) -> SyncResult<OperationId>;

    /// Time stamped on new items; the session's clock where there is one.
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[async_trait]
impl UpdateSink for OrchestratorHandle {
    async fn submit(&self, item: UpdateItem) -> SyncResult<OperationId> {
        OrchestratorHandle::submit(self, item).await
    }

    fn now(&self) -> Timestamp {
        OrchestratorHandle::now(self)
    }
}

// ── Dashboard ────────────────────────────────────────────────────

/// Grid placement of a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetPosition {
    pub x: u32,
    pub y: u32,
    #[serde(rename = "w")]
    pub width: u32,
    #[serde(rename = "h")]
    pub height: u32,
}

/// Dashboard customization for one dashboard.
pub struct DashboardFacade<S> {
    sink: S,
    dashboard_id: String,
}

impl<S: UpdateSink> DashboardFacade<S> {
    pub fn new(sink: S, dashboard_id: impl Into<String>) -> Self {
        Self {
            sink,
            dashboard_id: dashboard_id.into(),
        }
    }

    pub fn dashboard_id(&self) -> &str {
        &self.dashboard_id
    }

    /// Updates dashboard-level fields.
    pub async fn update_dashboard(&self, fields: Value) -> SyncResult<OperationId> {
        let payload = UpdatePayload::dashboard(self.dashboard_id.clone(), fields);
        self.submit(payload).await
    }

    pub async fn rename(&self, name: &str) -> SyncResult<OperationId> {
        self.update_dashboard(json!({ "name": name })).await
    }

    /// Updates a widget's settings.
    pub async fn update_widget(&self, widget_id: &str, fields: Value) -> SyncResult<OperationId> {
        self.submit(UpdatePayload::widget(widget_id, fields)).await
    }

    /// Moves or resizes a widget. Drags deliver ahead of other edits.
    pub async fn move_widget(
        &self,
        widget_id: &str,
        position: WidgetPosition,
    ) -> SyncResult<OperationId> {
        let payload = UpdatePayload::widget(widget_id, json!({ "position": position }));
        let item = UpdateItem::at(payload, self.sink.now()).with_priority(1);
        self.sink.submit(item).await
    }

    pub async fn remove_widget(&self, widget_id: &str) -> SyncResult<OperationId> {
        self.update_widget(widget_id, json!({ "removed": true })).await
    }

    /// Updates a layout's fields.
    pub async fn update_layout(&self, layout_id: &str, fields: Value) -> SyncResult<OperationId> {
        self.submit(UpdatePayload::layout(layout_id, fields)).await
    }

    /// Merges theme settings into the current theme.
    pub async fn set_theme(&self, theme: Value) -> SyncResult<OperationId> {
        self.submit(UpdatePayload::theme(theme)).await
    }

    async fn submit(&self, payload: UpdatePayload) -> SyncResult<OperationId> {
        self.sink.submit(UpdateItem::at(payload, self.sink.now())).await
    }
}

// ── Notifications ────────────────────────────────────────────────

/// Notification read/dismiss state.
pub struct NotificationFacade<S> {
    sink: S,
}

impl<S: UpdateSink> NotificationFacade<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub async fn mark_read(&self, notification_id: &str) -> SyncResult<OperationId> {
        self.set(notification_id, json!({ "read": true })).await
    }

    pub async fn mark_unread(&self, notification_id: &str) -> SyncResult<OperationId> {
        self.set(notification_id, json!({ "read": false })).await
    }

    pub async fn dismiss(&self, notification_id: &str) -> SyncResult<OperationId> {
        self.set(notification_id, json!({ "dismissed": true })).await
    }

    /// Marks several notifications read; stops at the first failure.
    pub async fn mark_all_read(&self, notification_ids: &[&str]) -> SyncResult<Vec<OperationId>> {
        let mut ids = Vec::with_capacity(notification_ids.len());
        for id in notification_ids {
            ids.push(self.mark_read(id).await?);
        }
        Ok(ids)
    }

    async fn set(&self, notification_id: &str, fields: Value) -> SyncResult<OperationId> {
        let payload = UpdatePayload::notification(notification_id, fields);
        self.sink.submit(UpdateItem::at(payload, self.sink.now())).await
    }
}

// ── Status indicator ─────────────────────────────────────────────

/// What a sync indicator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorState {
    Synced,
    Syncing,
    Offline,
    Conflict,
    Error,
}

impl IndicatorState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Synced => "All changes saved",
            Self::Syncing => "Syncing…",
            Self::Offline => "Offline",
            Self::Conflict => "Needs attention",
            Self::Error => "Sync error",
        }
    }
}

/// Folds session events into what a status badge displays.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusIndicator {
    connection: ConnectionStatus,
    exhausted: bool,
    pending: usize,
    conflicts: usize,
    last_error: Option<String>,
    last_synced_at: Option<Timestamp>,
}

impl SyncStatusIndicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event.
    pub fn apply(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::ConnectionChanged { status, .. } => {
                self.connection = *status;
                if *status == ConnectionStatus::Open {
                    self.exhausted = false;
                }
            }
            SyncEvent::ConnectionExhausted { attempts } => {
                self.exhausted = true;
                self.last_error = Some(format!("gave up reconnecting after {attempts} attempts"));
            }
            SyncEvent::StateChanged { .. } | SyncEvent::ServerNotice { .. } => {}
            SyncEvent::OperationConfirmed { .. } => {
                self.pending = self.pending.saturating_sub(1);
            }
            SyncEvent::OperationExpired { key, .. } => {
                self.pending = self.pending.saturating_sub(1);
                self.last_error = Some(format!("change to {key} was not saved"));
            }
            SyncEvent::OperationRejected { reason, .. } => {
                self.pending = self.pending.saturating_sub(1);
                self.last_error = Some(reason.clone());
            }
            SyncEvent::ConflictDetected(conflict) => {
                if !conflict.resolved {
                    self.conflicts += 1;
                }
            }
            SyncEvent::ConflictUnresolved { key, .. } => {
                self.conflicts = self.conflicts.saturating_sub(1);
                self.last_error = Some(format!("conflict on {key} resolved from server"));
            }
            SyncEvent::SyncFailed { attempts, .. } => {
                self.last_error = Some(format!("change failed after {attempts} attempts"));
            }
            SyncEvent::OperationDropped { .. } => {
                self.last_error = Some("offline queue full, a change was dropped".to_string());
            }
            SyncEvent::ServerError { message, .. } => {
                self.last_error = Some(message.clone());
            }
        }
    }

    /// Replaces counters with authoritative session values.
    pub fn update(&mut self, snapshot: &SessionSnapshot) {
        self.connection = snapshot.connection.status;
        self.pending = snapshot.sync.pending_count;
        self.conflicts = snapshot.sync.conflict_count;
        self.last_synced_at = snapshot.sync.last_synced_at;
    }

    /// Acknowledges the last error.
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_synced_at(&self) -> Option<Timestamp> {
        self.last_synced_at
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }

    /// What to show right now.
    #[must_use]
    pub fn state(&self) -> IndicatorState {
        if self.exhausted || self.connection == ConnectionStatus::Closed {
            IndicatorState::Offline
        } else if self.conflicts > 0 {
            IndicatorState::Conflict
        } else if self.last_error.is_some() {
            IndicatorState::Error
        } else if self.pending > 0 || self.connection != ConnectionStatus::Open {
            IndicatorState::Syncing
        } else {
            IndicatorState::Synced
        }
    }
}
