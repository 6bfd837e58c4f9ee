use dashsync_types::{
    into_fields, BatchUpdate, Error, Timestamp, UpdateItem, UpdateKey, UpdatePayload,
};
use pretty_assertions::assert_eq;
use serde_json::json;

// ── Keys ──────────────────────────────────────────────────────────

#[test]
fn key_uses_data_id() {
    let payload = UpdatePayload::widget("w-1", json!({"x": 1}));
    assert_eq!(payload.key(), UpdateKey::new("widget", Some("w-1")));
    assert_eq!(payload.key().as_str(), "widget:w-1");
}

#[test]
fn theme_key_is_global() {
    let payload = UpdatePayload::theme(json!({"mode": "dark"}));
    assert_eq!(payload.key().as_str(), "theme:global");
}

#[test]
fn opaque_key_reads_id_field() {
    let with_id = UpdatePayload::opaque("chart", json!({"id": "c-9", "zoom": 2}));
    assert_eq!(with_id.key().as_str(), "chart:c-9");

    let without_id = UpdatePayload::opaque("chart", json!({"zoom": 2}));
    assert_eq!(without_id.key().as_str(), "chart:global");
}

// ── Fields ────────────────────────────────────────────────────────

#[test]
fn into_fields_wraps_scalars() {
    assert_eq!(into_fields(json!(3))["value"], json!(3));
    assert!(into_fields(serde_json::Value::Null).is_empty());
    assert_eq!(into_fields(json!({"a": 1}))["a"], json!(1));
}

#[test]
fn only_preferences_are_snapshots() {
    assert!(UpdatePayload::preference("theme", json!({})).is_snapshot());
    assert!(!UpdatePayload::theme(json!({})).is_snapshot());
    assert!(!UpdatePayload::widget("w", json!({})).is_snapshot());
}

// ── Merge ─────────────────────────────────────────────────────────

#[test]
fn merge_is_shallow_and_keeps_latest_timestamp() {
    let mut first = UpdateItem::at(
        UpdatePayload::widget("w-1", json!({"x": 1, "y": 1, "style": {"color": "red"}})),
        Timestamp::from_millis(100),
    );
    let second = UpdateItem::at(
        UpdatePayload::widget("w-1", json!({"y": 2, "style": {"border": 1}})),
        Timestamp::from_millis(200),
    )
    .with_priority(5);

    first.merge(&second);

    assert_eq!(
        serde_json::Value::Object(first.payload.fields().clone()),
        json!({"x": 1, "y": 2, "style": {"border": 1}})
    );
    assert_eq!(first.timestamp, Timestamp::from_millis(200));
    assert_eq!(first.id, second.id);
    assert_eq!(first.priority, Some(5));
}

#[test]
fn merge_without_priority_keeps_existing() {
    let mut first = UpdateItem::new(UpdatePayload::theme(json!({"mode": "light"}))).with_priority(3);
    let second = UpdateItem::new(UpdatePayload::theme(json!({"mode": "dark"})));
    first.merge(&second);
    assert_eq!(first.priority, Some(3));
    assert_eq!(first.effective_priority(), 3);
}

// ── Wire format ───────────────────────────────────────────────────

#[test]
fn wire_format_puts_target_in_data() {
    let item = UpdateItem::at(
        UpdatePayload::widget("w-1", json!({"x": 4})),
        Timestamp::from_millis(10),
    );
    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["type"], json!("widget"));
    assert_eq!(value["data"], json!({"widgetId": "w-1", "x": 4}));
    assert_eq!(value["timestamp"], json!(10));
    assert!(value.get("priority").is_none());
}

#[test]
fn wire_roundtrip_for_known_kind() {
    let item = UpdateItem::new(UpdatePayload::preference("notifications", json!({"email": false})))
        .with_priority(1);
    let json = serde_json::to_string(&item).unwrap();
    let parsed: UpdateItem = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, item);
}

#[test]
fn unknown_kind_becomes_opaque() {
    let id = dashsync_types::UpdateId::new();
    let json = json!({"id": id, "type": "sparkline", "data": {"id": "s1", "points": [1, 2]}, "timestamp": 5});
    let item: UpdateItem = serde_json::from_value(json).unwrap();
    match &item.payload {
        UpdatePayload::Opaque { kind, fields } => {
            assert_eq!(kind, "sparkline");
            assert_eq!(fields["points"], json!([1, 2]));
        }
        other => panic!("Expected Opaque, got {other:?}"),
    }
    assert_eq!(item.key().as_str(), "sparkline:s1");
}

#[test]
fn numeric_target_is_accepted() {
    let payload = UpdatePayload::from_wire("layout", into_fields(json!({"layoutId": 7}))).unwrap();
    assert_eq!(payload.data_id(), Some("7"));
}

#[test]
fn known_kind_without_target_is_rejected() {
    let err = UpdatePayload::from_wire("widget", into_fields(json!({"x": 1}))).unwrap_err();
    match err {
        Error::MissingTarget { kind, field } => {
            assert_eq!(kind, "widget");
            assert_eq!(field, "widgetId");
        }
        other => panic!("Expected MissingTarget, got {other:?}"),
    }
}

#[test]
fn empty_kind_is_rejected() {
    assert!(UpdatePayload::from_wire("", into_fields(json!({}))).is_err());
}

// ── BatchUpdate ───────────────────────────────────────────────────

#[test]
fn batch_serializes_camel_case() {
    let mut batch = BatchUpdate::new(
        vec![UpdateItem::new(UpdatePayload::theme(json!({"mode": "dark"})))],
        Timestamp::from_millis(1),
    );
    assert_eq!(batch.len(), 1);
    assert!(!batch.is_empty());

    batch.processed_at = Some(Timestamp::from_millis(2));
    let value = serde_json::to_value(&batch).unwrap();
    assert_eq!(value["processedAt"], json!(2));

    let parsed: BatchUpdate = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, batch);
}
