mod common;

use common::{reconciler_config, theme, ts, widget};
use dashsync_sync::{
    ConflictStrategy, OperationStatus, OptimisticReconciler, ReconcileOutcome, ReconcilerConfig,
    Resolution, SyncEvent,
};
use dashsync_types::{Fields, UpdateItem, UpdateKey, UpdatePayload};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn reconciler(strategy: ConflictStrategy) -> OptimisticReconciler {
    OptimisticReconciler::new(ReconcilerConfig {
        conflict_strategy: strategy,
        ..reconciler_config()
    })
}

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn expired_events(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::OperationExpired { .. }))
        .count()
}

/// Seeds confirmed state for a key through a remote update.
fn seed(reconciler: &mut OptimisticReconciler, item: UpdateItem) -> UpdateKey {
    let key = item.key();
    assert_eq!(
        reconciler.reconcile_incoming(item, ts(0)),
        ReconcileOutcome::Applied
    );
    reconciler.drain_events();
    key
}

// ── Optimistic apply ─────────────────────────────────────────────

#[test]
fn optimistic_update_shows_immediately() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"title": "Sales"}), 0);
    let key = item.key();
    let id = reconciler.apply_optimistic(item, ts(0));

    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Sales"}))));
    assert_eq!(reconciler.status(id), Some(OperationStatus::Pending));
    assert!(reconciler.has_pending(&key));
    assert_eq!(reconciler.confirmed_value(&key), None);
    assert_eq!(
        reconciler.drain_events(),
        vec![SyncEvent::StateChanged { keys: vec![key] }]
    );
}

#[test]
fn reapplying_same_operation_is_ignored() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"n": 1}), 0);
    reconciler.apply_optimistic(item.clone(), ts(0));
    reconciler.apply_optimistic(item, ts(1));
    assert_eq!(reconciler.pending_count(), 1);
}

// ── Confirmation ─────────────────────────────────────────────────

#[test]
fn confirm_moves_value_into_confirmed_state() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"title": "Sales"}), 0);
    let key = item.key();
    let id = reconciler.apply_optimistic(item, ts(0));
    reconciler.drain_events();

    assert!(reconciler.confirm(id, None, ts(50)));
    assert_eq!(reconciler.status(id), Some(OperationStatus::Confirmed));
    assert_eq!(
        reconciler.confirmed_value(&key),
        Some(&fields(json!({"title": "Sales"})))
    );
    assert_eq!(reconciler.sync_status().last_synced_at, Some(ts(50)));
    assert!(reconciler.sync_status().is_synced);
    assert_eq!(
        reconciler.drain_events(),
        vec![SyncEvent::OperationConfirmed { operation_id: id }]
    );
}

#[test]
fn duplicate_ack_is_a_no_op() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"title": "Sales"}), 0);
    let id = reconciler.apply_optimistic(item, ts(0));
    assert!(reconciler.confirm(id, None, ts(10)));
    reconciler.drain_events();

    assert!(!reconciler.confirm(id, Some(json!({"title": "Other"})), ts(20)));
    assert!(reconciler.drain_events().is_empty());
    assert_eq!(reconciler.status(id), Some(OperationStatus::Confirmed));
}

#[test]
fn server_value_in_ack_wins_over_sent_value() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"title": "sales  "}), 0);
    let key = item.key();
    let id = reconciler.apply_optimistic(item, ts(0));
    reconciler.confirm(id, Some(json!({"title": "sales"})), ts(10));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "sales"}))));
}

#[test]
fn confirm_cascades_to_older_operations_on_key() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let first = reconciler.apply_optimistic(widget("w1", json!({"a": 1}), 0), ts(0));
    let second = reconciler.apply_optimistic(widget("w1", json!({"b": 2}), 1), ts(1));
    let third = reconciler.apply_optimistic(widget("w1", json!({"c": 3}), 2), ts(2));

    reconciler.confirm(second, None, ts(10));
    assert_eq!(reconciler.status(first), Some(OperationStatus::Confirmed));
    assert_eq!(reconciler.status(second), Some(OperationStatus::Confirmed));
    assert_eq!(reconciler.status(third), Some(OperationStatus::Pending));
}

#[test]
fn pending_operations_stay_layered_over_confirmed_value() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let first = reconciler.apply_optimistic(widget("w1", json!({"a": 1}), 0), ts(0));
    let second = widget("w1", json!({"b": 2}), 1);
    let key = second.key();
    reconciler.apply_optimistic(second, ts(1));

    reconciler.confirm(first, Some(json!({"a": 10})), ts(5));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"a": 10, "b": 2}))));
}

// ── Expiry and rejection ─────────────────────────────────────────

#[test]
fn unacknowledged_update_rolls_back_with_one_event() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Old"}), 0));

    let id = reconciler.apply_optimistic(widget("w1", json!({"title": "New"}), 1), ts(1_000));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "New"}))));
    reconciler.drain_events();

    assert_eq!(reconciler.sweep(ts(10_999)), 0);
    assert_eq!(reconciler.sweep(ts(11_000)), 1);
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Old"}))));
    assert_eq!(reconciler.status(id), Some(OperationStatus::Expired));

    let events = reconciler.drain_events();
    assert_eq!(expired_events(&events), 1);
    assert!(events.contains(&SyncEvent::OperationExpired {
        operation_id: id,
        key: key.clone()
    }));

    assert_eq!(reconciler.sweep(ts(20_000)), 0);
    assert!(reconciler.drain_events().is_empty());
    assert!(!reconciler.confirm(id, None, ts(20_001)));
}

#[test]
fn expiry_of_fresh_key_removes_it_from_view() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w9", json!({"x": 1}), 0);
    let key = item.key();
    reconciler.apply_optimistic(item, ts(0));
    reconciler.sweep(ts(10_000));
    assert_eq!(reconciler.view(&key), None);
}

#[test]
fn next_deadline_tracks_expiry_and_sweep_interval() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    assert_eq!(reconciler.next_deadline(), None);
    reconciler.apply_optimistic(widget("w1", json!({}), 0), ts(0));
    assert_eq!(reconciler.next_deadline(), Some(ts(10_000)));

    reconciler.apply_optimistic(widget("w2", json!({}), 0), ts(9_500));
    reconciler.sweep(ts(10_000));
    // w2 expires at 19_500; the sweep interval does not delay it.
    assert_eq!(reconciler.next_deadline(), Some(ts(19_500)));
}

#[test]
fn rejection_rolls_back_and_reports_reason() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Old"}), 0));
    let id = reconciler.apply_optimistic(widget("w1", json!({"title": "Bad"}), 1), ts(1));
    reconciler.drain_events();

    assert!(reconciler.reject(id, "title too long"));
    assert!(!reconciler.reject(id, "again"));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Old"}))));
    let events = reconciler.drain_events();
    assert!(events.contains(&SyncEvent::OperationRejected {
        operation_id: id,
        reason: "title too long".into()
    }));
}

#[test]
fn expire_all_settles_everything() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    reconciler.apply_optimistic(widget("w1", json!({}), 0), ts(0));
    reconciler.apply_optimistic(widget("w2", json!({}), 0), ts(0));
    assert_eq!(reconciler.expire_all(), 2);
    assert_eq!(reconciler.pending_count(), 0);
    assert_eq!(expired_events(&reconciler.drain_events()), 2);
}

// ── Remote updates ───────────────────────────────────────────────

#[test]
fn remote_update_without_local_ops_applies() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let key = seed(&mut reconciler, widget("w1", json!({"a": 1}), 0));
    reconciler.reconcile_incoming(widget("w1", json!({"b": 2}), 1), ts(1));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"a": 1, "b": 2}))));
}

#[test]
fn echo_of_pending_operation_confirms_it() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"a": 1}), 0);
    let id = reconciler.apply_optimistic(item.clone(), ts(0));

    assert_eq!(
        reconciler.reconcile_incoming(item.clone(), ts(5)),
        ReconcileOutcome::Confirmed(id)
    );
    assert_eq!(
        reconciler.reconcile_incoming(item, ts(6)),
        ReconcileOutcome::Duplicate
    );
}

#[test]
fn echo_of_expired_operation_is_applied_as_server_state() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let item = widget("w1", json!({"a": 1}), 0);
    let key = item.key();
    reconciler.apply_optimistic(item.clone(), ts(0));
    reconciler.sweep(ts(10_000));
    assert_eq!(reconciler.view(&key), None);

    assert_eq!(
        reconciler.reconcile_incoming(item, ts(12_000)),
        ReconcileOutcome::Applied
    );
    assert_eq!(reconciler.view(&key), Some(fields(json!({"a": 1}))));
}

// ── Conflict strategies ──────────────────────────────────────────

#[test]
fn remote_wins_discards_local_effect() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let key = seed(&mut reconciler, theme(json!({"mode": "light"}), 0));
    let id = reconciler.apply_optimistic(theme(json!({"mode": "dark"}), 1), ts(1));

    let outcome = reconciler.reconcile_incoming(theme(json!({"mode": "sepia"}), 2), ts(2));
    assert!(matches!(outcome, ReconcileOutcome::Conflict(_)));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"mode": "sepia"}))));
    assert_eq!(reconciler.status(id), Some(OperationStatus::Conflicted));

    let events = reconciler.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::ConflictDetected(c) if c.resolved && c.operation_ids == vec![id]
    )));
    // A later ack for the conflicted operation changes nothing.
    assert!(!reconciler.confirm(id, None, ts(3)));
}

#[test]
fn local_wins_holds_remote_until_confirmed() {
    let mut reconciler = reconciler(ConflictStrategy::LocalWins);
    let key = seed(&mut reconciler, theme(json!({"mode": "light"}), 0));
    let id = reconciler.apply_optimistic(theme(json!({"mode": "dark"}), 10), ts(10));

    reconciler.reconcile_incoming(theme(json!({"mode": "sepia", "font": "serif"}), 5), ts(11));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"mode": "dark"}))));
    assert_eq!(reconciler.status(id), Some(OperationStatus::Pending));

    reconciler.confirm(id, None, ts(12));
    // The held remote is older than the confirmed local, so it is dropped.
    assert_eq!(reconciler.view(&key), Some(fields(json!({"mode": "dark"}))));
}

#[test]
fn local_wins_applies_newer_held_remote_after_confirm() {
    let mut reconciler = reconciler(ConflictStrategy::LocalWins);
    let key = seed(&mut reconciler, theme(json!({"mode": "light"}), 0));
    let id = reconciler.apply_optimistic(theme(json!({"mode": "dark"}), 10), ts(10));
    reconciler.reconcile_incoming(theme(json!({"font": "serif"}), 20), ts(20));

    reconciler.confirm(id, None, ts(21));
    assert_eq!(
        reconciler.view(&key),
        Some(fields(json!({"mode": "dark", "font": "serif"})))
    );
}

#[test]
fn local_wins_releases_held_remote_on_expiry() {
    let mut reconciler = reconciler(ConflictStrategy::LocalWins);
    let key = seed(&mut reconciler, theme(json!({"mode": "light"}), 0));
    reconciler.apply_optimistic(theme(json!({"mode": "dark"}), 10), ts(10));
    reconciler.reconcile_incoming(theme(json!({"mode": "sepia"}), 5), ts(11));

    reconciler.sweep(ts(10_010));
    assert_eq!(reconciler.view(&key), Some(fields(json!({"mode": "sepia"}))));
}

#[test]
fn manual_conflict_keeps_local_view_until_resolved() {
    let mut reconciler = reconciler(ConflictStrategy::Manual);
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Base"}), 0));
    let id = reconciler.apply_optimistic(widget("w1", json!({"title": "Mine"}), 1), ts(1));

    let ReconcileOutcome::Conflict(conflict_id) =
        reconciler.reconcile_incoming(widget("w1", json!({"title": "Theirs"}), 2), ts(2))
    else {
        panic!("expected a conflict");
    };
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Mine"}))));
    assert_eq!(reconciler.status(id), Some(OperationStatus::Conflicted));
    assert_eq!(reconciler.sync_status().conflict_count, 1);

    let conflict = reconciler.conflict(conflict_id).unwrap();
    assert!(!conflict.resolved);
    assert_eq!(conflict.local, Some(fields(json!({"title": "Mine"}))));
    assert_eq!(conflict.remote.payload.fields()["title"], "Theirs");

    // More remote updates fold into the open conflict.
    assert_eq!(
        reconciler.reconcile_incoming(widget("w1", json!({"color": "red"}), 3), ts(3)),
        ReconcileOutcome::Held(conflict_id)
    );
}

#[test]
fn manual_take_remote() {
    let mut reconciler = reconciler(ConflictStrategy::Manual);
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Base"}), 0));
    reconciler.apply_optimistic(widget("w1", json!({"title": "Mine"}), 1), ts(1));
    let ReconcileOutcome::Conflict(conflict_id) =
        reconciler.reconcile_incoming(widget("w1", json!({"title": "Theirs"}), 2), ts(2))
    else {
        panic!("expected a conflict");
    };

    let resend = reconciler
        .resolve_conflict(conflict_id, Resolution::TakeRemote, ts(3))
        .unwrap();
    assert!(resend.is_none());
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Theirs"}))));
    assert_eq!(reconciler.sync_status().conflict_count, 0);
    assert!(reconciler
        .resolve_conflict(conflict_id, Resolution::TakeRemote, ts(4))
        .is_err());
}

#[test]
fn manual_keep_local_returns_item_to_resend() {
    let mut reconciler = reconciler(ConflictStrategy::Manual);
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Base"}), 0));
    reconciler.apply_optimistic(widget("w1", json!({"title": "Mine"}), 1), ts(1));
    let ReconcileOutcome::Conflict(conflict_id) =
        reconciler.reconcile_incoming(widget("w1", json!({"title": "Theirs"}), 2), ts(2))
    else {
        panic!("expected a conflict");
    };

    let resend = reconciler
        .resolve_conflict(conflict_id, Resolution::KeepLocal, ts(3))
        .unwrap()
        .unwrap();
    assert_eq!(resend.key(), key);
    assert_eq!(resend.payload.fields()["title"], "Mine");
    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Mine"}))));
    assert_eq!(reconciler.status(resend.id), Some(OperationStatus::Pending));
    assert_eq!(
        reconciler.confirmed_value(&key),
        Some(&fields(json!({"title": "Theirs"})))
    );
}

#[test]
fn manual_custom_resolution() {
    let mut reconciler = reconciler(ConflictStrategy::Manual);
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Base"}), 0));
    reconciler.apply_optimistic(widget("w1", json!({"title": "Mine"}), 1), ts(1));
    let ReconcileOutcome::Conflict(conflict_id) =
        reconciler.reconcile_incoming(widget("w1", json!({"title": "Theirs"}), 2), ts(2))
    else {
        panic!("expected a conflict");
    };

    reconciler
        .resolve_conflict(
            conflict_id,
            Resolution::Custom(fields(json!({"title": "Mine and theirs"}))),
            ts(3),
        )
        .unwrap();
    assert_eq!(
        reconciler.view(&key),
        Some(fields(json!({"title": "Mine and theirs"})))
    );
}

#[test]
fn unresolved_manual_conflict_ages_out_to_remote() {
    let mut reconciler = OptimisticReconciler::new(ReconcilerConfig {
        conflict_strategy: ConflictStrategy::Manual,
        conflict_retention_ms: 60_000,
        ..reconciler_config()
    });
    let key = seed(&mut reconciler, widget("w1", json!({"title": "Base"}), 0));
    reconciler.apply_optimistic(widget("w1", json!({"title": "Mine"}), 1), ts(1));
    let ReconcileOutcome::Conflict(conflict_id) =
        reconciler.reconcile_incoming(widget("w1", json!({"title": "Theirs"}), 2), ts(2))
    else {
        panic!("expected a conflict");
    };
    reconciler.drain_events();

    assert_eq!(reconciler.next_deadline(), Some(ts(60_002)));
    reconciler.sweep(ts(60_002));

    assert_eq!(reconciler.view(&key), Some(fields(json!({"title": "Theirs"}))));
    assert!(reconciler.conflict(conflict_id).is_none());
    let unresolved: Vec<_> = reconciler
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::ConflictUnresolved { .. }))
        .collect();
    assert_eq!(
        unresolved,
        vec![SyncEvent::ConflictUnresolved { conflict_id, key }]
    );
}

#[test]
fn strategy_change_applies_to_new_conflicts() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    reconciler.set_conflict_strategy(ConflictStrategy::Manual);
    reconciler.apply_optimistic(widget("w1", json!({"a": 1}), 0), ts(0));
    let outcome = reconciler.reconcile_incoming(widget("w1", json!({"a": 2}), 1), ts(1));
    let ReconcileOutcome::Conflict(id) = outcome else {
        panic!("expected a conflict");
    };
    assert_eq!(
        reconciler.conflict(id).unwrap().strategy,
        ConflictStrategy::Manual
    );
}

// ── Snapshot payloads ────────────────────────────────────────────

#[test]
fn preference_snapshots_replace_the_section() {
    let mut reconciler = reconciler(ConflictStrategy::RemoteWins);
    let first = UpdateItem::at(
        UpdatePayload::preference("layout", json!({"density": "compact", "grid": 12})),
        ts(0),
    );
    let key = seed(&mut reconciler, first);
    let second = UpdateItem::at(
        UpdatePayload::preference("layout", json!({"density": "comfortable"})),
        ts(1),
    );
    reconciler.reconcile_incoming(second, ts(1));
    assert_eq!(
        reconciler.view(&key),
        Some(fields(json!({"density": "comfortable"})))
    );
}
