//! Cross-device preference sync.
//!
//! Every local change to a preference section is recorded as a durable
//! [`SyncChange`]. Each device periodically pulls the changes other devices
//! made that it has not applied yet, applies the winners through the
//! reconciler and marks them synced. A change becomes fully synced once
//! every other active device has applied it.
//!
//! Concurrent edits to one section resolve by [`SyncChange::precedence`]:
//! the strictly later `created_at` wins, ties go to the lexically greater
//! device id. Losing changes are kept for audit and never reapplied.

use crate::error::{SyncError, SyncResult};
use crate::reconciler::{OptimisticReconciler, ViewStore};
use async_trait::async_trait;
use dashsync_types::{
    ChangeId, Device, DeviceId, SyncChange, Timestamp, UpdateId, UpdateItem, UpdatePayload,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Fully synced changes the in-memory backend keeps for inspection.
const SYNCED_RETENTION: usize = 256;

/// Losing changes a device keeps for audit.
pub const HISTORY_LIMIT: usize = 100;

/// The persistence layer behind preference sync.
#[async_trait]
pub trait PreferenceBackend: Send + Sync {
    /// The stored preference document (`{section: value}`).
    async fn get_config(&self) -> SyncResult<Value>;

    /// Persists a change made by its owning device.
    async fn save_change(&self, change: &SyncChange) -> SyncResult<()>;

    /// Changes made by other devices that `device` has not applied yet.
    async fn get_unsynced_changes(&self, device: &DeviceId) -> SyncResult<Vec<SyncChange>>;

    /// Records that `device` applied the given changes.
    async fn mark_synced(&self, device: &DeviceId, ids: &[ChangeId]) -> SyncResult<()>;

    /// Registered devices.
    async fn get_devices(&self) -> SyncResult<Vec<Device>>;

    /// Registers (or re-registers) a device.
    async fn register_device(&self, device: &Device) -> SyncResult<Device>;

    /// Updates a device's name, trust or activity.
    async fn update_device(&self, device: &Device) -> SyncResult<Device>;

    /// Forgets a device.
    async fn remove_device(&self, device_id: &DeviceId) -> SyncResult<()>;
}

// ── In-memory backend ────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    changes: Vec<SyncChange>,
    applied_by: HashMap<ChangeId, HashSet<DeviceId>>,
    devices: HashMap<DeviceId, Device>,
    /// Winning change per section.
    sections: HashMap<String, SyncChange>,
}

impl MemoryState {
    fn refresh_synced(&mut self, now: Timestamp) {
        let active: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| d.is_active)
            .map(|d| d.device_id.clone())
            .collect();
        for change in self.changes.iter_mut().filter(|c| !c.is_synced) {
            let applied = self.applied_by.get(&change.id);
            let everyone = active
                .iter()
                .filter(|d| **d != change.device_id)
                .all(|d| applied.is_some_and(|set| set.contains(d)));
            if everyone {
                change.is_synced = true;
                change.sync_timestamp = Some(now);
            }
        }
        self.prune_synced();
    }

    /// Drops the oldest fully synced changes beyond the retention limit.
    /// Section winners are kept separately and are never pruned.
    fn prune_synced(&mut self) {
        let synced = self.changes.iter().filter(|c| c.is_synced).count();
        let mut excess = synced.saturating_sub(SYNCED_RETENTION);
        if excess == 0 {
            return;
        }
        let mut pruned = Vec::with_capacity(excess);
        self.changes.retain(|c| {
            if excess > 0 && c.is_synced {
                excess -= 1;
                pruned.push(c.id);
                false
            } else {
                true
            }
        });
        for id in &pruned {
            self.applied_by.remove(id);
        }
        debug!("Pruned {} synced preference changes", pruned.len());
    }
}

/// In-process backend shared by every device in a test or a single-process
/// deployment.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryPreferenceBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded changes still retained, in save order.
    pub async fn changes(&self) -> Vec<SyncChange> {
        self.state.read().await.changes.clone()
    }

    /// A recorded change.
    pub async fn change(&self, id: ChangeId) -> Option<SyncChange> {
        self.state
            .read()
            .await
            .changes
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }
}

#[async_trait]
impl PreferenceBackend for MemoryPreferenceBackend {
    async fn get_config(&self) -> SyncResult<Value> {
        let state = self.state.read().await;
        let document: Map<String, Value> = state
            .sections
            .iter()
            .map(|(section, change)| (section.clone(), change.data.clone()))
            .collect();
        Ok(Value::Object(document))
    }

    async fn save_change(&self, change: &SyncChange) -> SyncResult<()> {
        let mut state = self.state.write().await;
        if state.changes.iter().any(|c| c.id == change.id) {
            return Ok(());
        }
        let wins = state
            .sections
            .get(&change.section)
            .is_none_or(|current| change.supersedes(current));
        if wins {
            state.sections.insert(change.section.clone(), change.clone());
        }
        state.changes.push(change.clone());
        Ok(())
    }

    async fn get_unsynced_changes(&self, device: &DeviceId) -> SyncResult<Vec<SyncChange>> {
        let state = self.state.read().await;
        Ok(state
            .changes
            .iter()
            .filter(|c| !c.is_synced && c.device_id != *device)
            .filter(|c| {
                !state
                    .applied_by
                    .get(&c.id)
                    .is_some_and(|set| set.contains(device))
            })
            .cloned()
            .collect())
    }

    async fn mark_synced(&self, device: &DeviceId, ids: &[ChangeId]) -> SyncResult<()> {
        let mut state = self.state.write().await;
        for id in ids {
            state
                .applied_by
                .entry(*id)
                .or_default()
                .insert(device.clone());
        }
        state.refresh_synced(Timestamp::now());
        Ok(())
    }

    async fn get_devices(&self) -> SyncResult<Vec<Device>> {
        let state = self.state.read().await;
        let mut devices: Vec<Device> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn register_device(&self, device: &Device) -> SyncResult<Device> {
        let mut state = self.state.write().await;
        state
            .devices
            .insert(device.device_id.clone(), device.clone());
        Ok(device.clone())
    }

    async fn update_device(&self, device: &Device) -> SyncResult<Device> {
        let mut state = self.state.write().await;
        if !state.devices.contains_key(&device.device_id) {
            return Err(SyncError::Backend(format!(
                "unknown device {}",
                device.device_id
            )));
        }
        state
            .devices
            .insert(device.device_id.clone(), device.clone());
        // Deactivating a device may complete other changes.
        state.refresh_synced(Timestamp::now());
        Ok(device.clone())
    }

    async fn remove_device(&self, device_id: &DeviceId) -> SyncResult<()> {
        let mut state = self.state.write().await;
        state.devices.remove(device_id);
        state.refresh_synced(Timestamp::now());
        Ok(())
    }
}

// ── HTTP backend ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChangesEnvelope {
    changes: Vec<SyncChange>,
}

#[derive(Deserialize)]
struct DevicesEnvelope {
    devices: Vec<Device>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkSyncedRequest<'a> {
    device_id: &'a DeviceId,
    change_ids: &'a [ChangeId],
}

/// Backend talking to the personalization REST API.
pub struct HttpPreferenceBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPreferenceBackend {
    /// Creates a backend for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Creates a backend sharing an existing client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn device_url(&self, device_id: &DeviceId) -> String {
        self.url(&format!(
            "/devices/{}",
            urlencoding::encode(device_id.as_str())
        ))
    }
}

#[async_trait]
impl PreferenceBackend for HttpPreferenceBackend {
    async fn get_config(&self) -> SyncResult<Value> {
        let response = self
            .client
            .get(self.url("/preferences"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn save_change(&self, change: &SyncChange) -> SyncResult<()> {
        self.client
            .post(self.url("/sync"))
            .json(change)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_unsynced_changes(&self, device: &DeviceId) -> SyncResult<Vec<SyncChange>> {
        let url = self.url(&format!(
            "/sync?synced=false&deviceId={}",
            urlencoding::encode(device.as_str())
        ));
        let envelope: ChangesEnvelope = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.changes)
    }

    async fn mark_synced(&self, device: &DeviceId, ids: &[ChangeId]) -> SyncResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .patch(self.url("/sync"))
            .json(&MarkSyncedRequest {
                device_id: device,
                change_ids: ids,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_devices(&self) -> SyncResult<Vec<Device>> {
        let envelope: DevicesEnvelope = self
            .client
            .get(self.url("/devices"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.devices)
    }

    async fn register_device(&self, device: &Device) -> SyncResult<Device> {
        let response = self
            .client
            .post(self.url("/devices"))
            .json(device)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn update_device(&self, device: &Device) -> SyncResult<Device> {
        let response = self
            .client
            .patch(self.device_url(&device.device_id))
            .json(&json!({
                "deviceName": device.device_name,
                "isTrusted": device.is_trusted,
                "isActive": device.is_active,
                "lastSeen": device.last_seen,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn remove_device(&self, device_id: &DeviceId) -> SyncResult<()> {
        self.client
            .delete(self.device_url(device_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ── Sync driver ──────────────────────────────────────────────────

/// Outcome of one [`PreferenceSync::sync_once`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Changes applied to the local view.
    pub applied: Vec<ChangeId>,
    /// Changes that lost to a newer change and were only recorded.
    pub superseded: Vec<ChangeId>,
    /// Changes acknowledged to the backend.
    pub marked_synced: usize,
}

/// Per-device preference sync.
pub struct PreferenceSync {
    backend: Arc<dyn PreferenceBackend>,
    device_id: DeviceId,
    /// Winning change per section, as seen by this device.
    current: HashMap<String, SyncChange>,
    /// Changes that lost, kept for audit (at most [`HISTORY_LIMIT`]).
    history: Vec<SyncChange>,
}

impl PreferenceSync {
    pub fn new(backend: Arc<dyn PreferenceBackend>, device_id: DeviceId) -> Self {
        Self {
            backend,
            device_id,
            current: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The change currently in effect for a section.
    #[must_use]
    pub fn current(&self, section: &str) -> Option<&SyncChange> {
        self.current.get(section)
    }

    /// Changes that lost to a newer change, oldest first.
    #[must_use]
    pub fn history(&self) -> &[SyncChange] {
        &self.history
    }

    fn item_for(change: &SyncChange) -> UpdateItem {
        let mut item = UpdateItem::at(
            UpdatePayload::preference(&change.section, change.data.clone()),
            change.created_at,
        );
        item.id = UpdateId::from_uuid(change.id.as_uuid());
        item
    }

    /// Records this device's change to `section`.
    ///
    /// The change is applied optimistically, persisted, then confirmed; if
    /// persisting fails it is rolled back. A change that loses to the one
    /// already in effect (an older `created_at` from a skewed clock) is
    /// persisted and kept for audit but never shown.
    pub async fn record_local_change<S: ViewStore>(
        &mut self,
        reconciler: &mut OptimisticReconciler<S>,
        section: &str,
        data: Value,
        now: Timestamp,
    ) -> SyncResult<SyncChange> {
        let change = SyncChange::new(self.device_id.clone(), section, data, now);

        if let Some(current) = self.current.get(section) {
            if !change.supersedes(current) {
                info!(
                    "Local change to {} predates change {}, recording only",
                    section, current.id
                );
                self.backend.save_change(&change).await?;
                self.record_loser(change.clone());
                return Ok(change);
            }
        }

        let item = Self::item_for(&change);
        let operation_id = reconciler.apply_optimistic(item, now);

        if let Err(e) = self.backend.save_change(&change).await {
            warn!("Saving change to {} failed: {}", section, e);
            reconciler.reject(operation_id, &e.to_string());
            return Err(e);
        }
        reconciler.confirm(operation_id, None, now);
        self.adopt(change.clone());
        debug!("Recorded local change {} to {}", change.id, section);
        Ok(change)
    }

    /// Pulls other devices' unapplied changes, applies the winners and marks
    /// everything pulled as synced for this device.
    pub async fn sync_once<S: ViewStore>(
        &mut self,
        reconciler: &mut OptimisticReconciler<S>,
        now: Timestamp,
    ) -> SyncResult<SyncReport> {
        let mut changes = self.backend.get_unsynced_changes(&self.device_id).await?;
        changes.sort_by(|a, b| a.precedence(b));

        let mut report = SyncReport::default();
        let mut seen = Vec::with_capacity(changes.len());
        for change in changes {
            seen.push(change.id);
            let wins = self
                .current
                .get(&change.section)
                .is_none_or(|current| change.supersedes(current));
            if wins {
                reconciler.reconcile_incoming(Self::item_for(&change), now);
                report.applied.push(change.id);
                self.adopt(change);
            } else {
                debug!(
                    "Change {} to {} superseded by a newer change",
                    change.id, change.section
                );
                report.superseded.push(change.id);
                self.record_loser(change);
            }
        }

        if !seen.is_empty() {
            self.backend.mark_synced(&self.device_id, &seen).await?;
            report.marked_synced = seen.len();
            info!(
                "Preference sync: {} applied, {} superseded",
                report.applied.len(),
                report.superseded.len()
            );
        }
        Ok(report)
    }

    /// Loads the stored preference document into the view as confirmed
    /// state (first run on a device).
    pub async fn load_config<S: ViewStore>(
        &mut self,
        reconciler: &mut OptimisticReconciler<S>,
        now: Timestamp,
    ) -> SyncResult<usize> {
        let Value::Object(document) = self.backend.get_config().await? else {
            return Err(SyncError::Backend("preference document is not an object".into()));
        };
        let count = document.len();
        for (section, value) in document {
            let item = UpdateItem::at(UpdatePayload::preference(section, value), now);
            reconciler.reconcile_incoming(item, now);
        }
        Ok(count)
    }

    /// Makes `change` current for its section, demoting the previous one to
    /// history.
    fn adopt(&mut self, change: SyncChange) {
        if let Some(previous) = self.current.insert(change.section.clone(), change) {
            self.record_loser(previous);
        }
    }

    fn record_loser(&mut self, change: SyncChange) {
        self.history.push(change);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}
