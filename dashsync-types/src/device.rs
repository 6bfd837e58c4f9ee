//! Devices and durable cross-device change records.

use crate::{ChangeId, DeviceId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A device registered for preference sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Row id assigned by the persistence layer.
    pub id: String,
    /// Stable device identifier.
    pub device_id: DeviceId,
    /// Human-readable name ("Work laptop").
    pub device_name: String,
    /// Whether the user marked this device as trusted.
    #[serde(default)]
    pub is_trusted: bool,
    /// Inactive devices are ignored when deciding whether a change is synced.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Last time the device was seen syncing.
    pub last_seen: Timestamp,
}

fn default_true() -> bool {
    true
}

impl Device {
    /// Creates an active, untrusted device record.
    pub fn new(device_id: DeviceId, device_name: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: device_id.to_string(),
            device_id,
            device_name: device_name.into(),
            is_trusted: false,
            is_active: true,
            last_seen: now,
        }
    }
}

/// Kind of change recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A section was created or replaced.
    Update,
    /// A section was reset to its defaults.
    Reset,
    /// A section was deleted.
    Delete,
}

/// A durable record of one device's change to a preference section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    /// Unique change id.
    pub id: ChangeId,
    /// Device that made the change.
    pub device_id: DeviceId,
    /// What kind of change this is.
    pub change_type: ChangeType,
    /// Preference section the change targets.
    pub section: String,
    /// New section value.
    pub data: Value,
    /// When the owning device made the change.
    pub created_at: Timestamp,
    /// Set once every other active device has applied the change.
    #[serde(default)]
    pub is_synced: bool,
    /// When the change became synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timestamp: Option<Timestamp>,
}

impl SyncChange {
    /// Creates an unsynced update change.
    pub fn new(
        device_id: DeviceId,
        section: impl Into<String>,
        data: Value,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            device_id,
            change_type: ChangeType::Update,
            section: section.into(),
            data,
            created_at,
            is_synced: false,
            sync_timestamp: None,
        }
    }

    /// Sets the change type.
    #[must_use]
    pub fn with_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = change_type;
        self
    }

    /// Deterministic "latest wins" order between two changes to one section.
    ///
    /// The strictly later `created_at` wins; equal timestamps are broken by
    /// the lexically greater device id, then by change id.
    #[must_use]
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.device_id.cmp(&other.device_id))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether this change wins over `other`.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        self.precedence(other) == Ordering::Greater
    }
}
