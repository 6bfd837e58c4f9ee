//! Update items and batches.
//!
//! An [`UpdateItem`] describes one atomic mutation of dashboard state. Its
//! payload is a tagged union of the update kinds the engine understands,
//! plus an [`UpdatePayload::Opaque`] variant that carries any other kind as a
//! plain key-value map so newer servers can talk to older clients.
//!
//! On the wire an item is `{id, type, data, timestamp, priority?}` where the
//! target identifier (e.g. `widgetId`) lives inside `data`.

use crate::{BatchId, Error, Result, Timestamp, UpdateId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Shallow key-value fields of an update.
pub type Fields = Map<String, Value>;

/// Target used in the dedup key when an update has no data id.
pub const GLOBAL_TARGET: &str = "global";

/// Turns a JSON value into update fields.
///
/// Objects are used as-is; any other value is wrapped as `{"value": v}`.
#[must_use]
pub fn into_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        Value::Null => Fields::new(),
        other => {
            let mut map = Fields::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Shallow-merges `incoming` into `base`: every top-level key of `incoming`
/// overwrites the same key in `base`.
pub fn merge_fields(base: &mut Fields, incoming: &Fields) {
    for (key, value) in incoming {
        base.insert(key.clone(), value.clone());
    }
}

/// Logical identity of an update: `type:dataId`, or `type:global`.
///
/// With dedup enabled, at most one queued item may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateKey(String);

impl UpdateKey {
    /// Builds a key from a kind name and an optional data id.
    pub fn new(kind: &str, data_id: Option<&str>) -> Self {
        Self(format!("{kind}:{}", data_id.unwrap_or(GLOBAL_TARGET)))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpdateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The typed body of an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// Dashboard-level settings.
    Dashboard { dashboard_id: String, fields: Fields },
    /// A single widget's configuration or position.
    Widget { widget_id: String, fields: Fields },
    /// A saved dashboard layout.
    Layout { layout_id: String, fields: Fields },
    /// Theme settings; there is one theme per user.
    Theme { fields: Fields },
    /// A whole preference section (`theme`, `notifications`, ...).
    ///
    /// Preference payloads are section snapshots: applying one replaces the
    /// confirmed section value rather than merging into it.
    Preference { section: String, fields: Fields },
    /// Notification state (read, dismissed, ...).
    Notification { notification_id: String, fields: Fields },
    /// Any kind this client does not know. The data id is read from `id`.
    Opaque { kind: String, fields: Fields },
}

impl UpdatePayload {
    /// Creates a dashboard update.
    pub fn dashboard(dashboard_id: impl Into<String>, fields: Value) -> Self {
        Self::Dashboard {
            dashboard_id: dashboard_id.into(),
            fields: into_fields(fields),
        }
    }

    /// Creates a widget update.
    pub fn widget(widget_id: impl Into<String>, fields: Value) -> Self {
        Self::Widget {
            widget_id: widget_id.into(),
            fields: into_fields(fields),
        }
    }

    /// Creates a layout update.
    pub fn layout(layout_id: impl Into<String>, fields: Value) -> Self {
        Self::Layout {
            layout_id: layout_id.into(),
            fields: into_fields(fields),
        }
    }

    /// Creates a theme update.
    pub fn theme(fields: Value) -> Self {
        Self::Theme {
            fields: into_fields(fields),
        }
    }

    /// Creates a preference section snapshot.
    pub fn preference(section: impl Into<String>, fields: Value) -> Self {
        Self::Preference {
            section: section.into(),
            fields: into_fields(fields),
        }
    }

    /// Creates a notification update.
    pub fn notification(notification_id: impl Into<String>, fields: Value) -> Self {
        Self::Notification {
            notification_id: notification_id.into(),
            fields: into_fields(fields),
        }
    }

    /// Creates an update of a kind this client has no typed model for.
    pub fn opaque(kind: impl Into<String>, fields: Value) -> Self {
        Self::Opaque {
            kind: kind.into(),
            fields: into_fields(fields),
        }
    }

    /// The wire name of this update's kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Dashboard { .. } => "dashboard",
            Self::Widget { .. } => "widget",
            Self::Layout { .. } => "layout",
            Self::Theme { .. } => "theme",
            Self::Preference { .. } => "preference",
            Self::Notification { .. } => "notification",
            Self::Opaque { kind, .. } => kind,
        }
    }

    /// The data id this update targets, if any.
    #[must_use]
    pub fn data_id(&self) -> Option<&str> {
        match self {
            Self::Dashboard { dashboard_id, .. } => Some(dashboard_id),
            Self::Widget { widget_id, .. } => Some(widget_id),
            Self::Layout { layout_id, .. } => Some(layout_id),
            Self::Theme { .. } => None,
            Self::Preference { section, .. } => Some(section),
            Self::Notification { notification_id, .. } => Some(notification_id),
            Self::Opaque { fields, .. } => fields.get("id").and_then(Value::as_str),
        }
    }

    /// The logical dedup key of this update.
    #[must_use]
    pub fn key(&self) -> UpdateKey {
        UpdateKey::new(self.kind(), self.data_id())
    }

    /// The shallow fields carried by this update.
    #[must_use]
    pub fn fields(&self) -> &Fields {
        match self {
            Self::Dashboard { fields, .. }
            | Self::Widget { fields, .. }
            | Self::Layout { fields, .. }
            | Self::Theme { fields }
            | Self::Preference { fields, .. }
            | Self::Notification { fields, .. }
            | Self::Opaque { fields, .. } => fields,
        }
    }

    /// Mutable access to the shallow fields.
    pub fn fields_mut(&mut self) -> &mut Fields {
        match self {
            Self::Dashboard { fields, .. }
            | Self::Widget { fields, .. }
            | Self::Layout { fields, .. }
            | Self::Theme { fields }
            | Self::Preference { fields, .. }
            | Self::Notification { fields, .. }
            | Self::Opaque { fields, .. } => fields,
        }
    }

    /// Whether applying this payload replaces the target's value instead of
    /// merging into it.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::Preference { .. })
    }

    /// Name of the `data` field holding the target id for a known kind.
    fn id_field(kind: &str) -> Option<&'static str> {
        match kind {
            "dashboard" => Some("dashboardId"),
            "widget" => Some("widgetId"),
            "layout" => Some("layoutId"),
            "preference" => Some("section"),
            "notification" => Some("notificationId"),
            _ => None,
        }
    }

    /// Builds a typed payload from a wire `type` and `data` object.
    pub fn from_wire(kind: &str, mut data: Fields) -> Result<Self> {
        if kind.is_empty() {
            return Err(Error::InvalidPayload("empty update type".into()));
        }
        if kind == "theme" {
            return Ok(Self::Theme { fields: data });
        }

        let Some(field) = Self::id_field(kind) else {
            return Ok(Self::Opaque {
                kind: kind.to_string(),
                fields: data,
            });
        };

        let id = match data.remove(field) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::MissingTarget {
                    kind: kind.to_string(),
                    field,
                });
            }
        };

        Ok(match kind {
            "dashboard" => Self::Dashboard {
                dashboard_id: id,
                fields: data,
            },
            "widget" => Self::Widget {
                widget_id: id,
                fields: data,
            },
            "layout" => Self::Layout {
                layout_id: id,
                fields: data,
            },
            "preference" => Self::Preference {
                section: id,
                fields: data,
            },
            _ => Self::Notification {
                notification_id: id,
                fields: data,
            },
        })
    }

    /// Splits the payload into a wire `type` and `data` object.
    #[must_use]
    pub fn to_wire(&self) -> (String, Fields) {
        let kind = self.kind().to_string();
        let mut data = self.fields().clone();
        if let (Some(field), Some(id)) = (Self::id_field(&kind), self.data_id()) {
            data.insert(field.to_string(), Value::String(id.to_string()));
        }
        (kind, data)
    }
}

/// An atomic mutation description.
///
/// Immutable once enqueued, except when the update processor merges a later
/// item with the same key into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawUpdateItem", into = "RawUpdateItem")]
pub struct UpdateItem {
    /// Unique id; also the id of the optimistic operation that submitted it.
    pub id: UpdateId,
    /// What is being changed.
    pub payload: UpdatePayload,
    /// When the mutation was made.
    pub timestamp: Timestamp,
    /// Higher values are delivered first within a batch.
    pub priority: Option<i32>,
}

impl UpdateItem {
    /// Creates an item stamped with the current wall clock.
    #[must_use]
    pub fn new(payload: UpdatePayload) -> Self {
        Self::at(payload, Timestamp::now())
    }

    /// Creates an item with an explicit timestamp.
    #[must_use]
    pub fn at(payload: UpdatePayload, timestamp: Timestamp) -> Self {
        Self {
            id: UpdateId::new(),
            payload,
            timestamp,
            priority: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// The logical dedup key.
    #[must_use]
    pub fn key(&self) -> UpdateKey {
        self.payload.key()
    }

    /// Priority used for ordering; absent means 0.
    #[must_use]
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    /// Folds a later item with the same key into this one.
    ///
    /// Fields are shallow-merged, the later timestamp is kept, and the later
    /// item's id and priority (if set) take over.
    pub fn merge(&mut self, later: &UpdateItem) {
        merge_fields(self.payload.fields_mut(), later.payload.fields());
        if later.timestamp >= self.timestamp {
            self.timestamp = later.timestamp;
        }
        self.id = later.id;
        if later.priority.is_some() {
            self.priority = later.priority;
        }
    }
}

/// Wire form of an [`UpdateItem`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawUpdateItem {
    id: UpdateId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Fields,
    timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<i32>,
}

impl TryFrom<RawUpdateItem> for UpdateItem {
    type Error = Error;

    fn try_from(raw: RawUpdateItem) -> Result<Self> {
        Ok(Self {
            id: raw.id,
            payload: UpdatePayload::from_wire(&raw.kind, raw.data)?,
            timestamp: raw.timestamp,
            priority: raw.priority,
        })
    }
}

impl From<UpdateItem> for RawUpdateItem {
    fn from(item: UpdateItem) -> Self {
        let (kind, data) = item.payload.to_wire();
        Self {
            id: item.id,
            kind,
            data,
            timestamp: item.timestamp,
            priority: item.priority,
        }
    }
}

/// A set of merged items delivered to handlers in one processing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdate {
    /// Unique batch id.
    pub id: BatchId,
    /// Items ordered by descending priority, then ascending timestamp.
    pub items: Vec<UpdateItem>,
    /// When the batch was assembled.
    pub timestamp: Timestamp,
    /// When every handler finished with the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<Timestamp>,
}

impl BatchUpdate {
    /// Creates an unprocessed batch.
    #[must_use]
    pub fn new(items: Vec<UpdateItem>, timestamp: Timestamp) -> Self {
        Self {
            id: BatchId::new(),
            items,
            timestamp,
            processed_at: None,
        }
    }

    /// Number of items in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
