mod common;

use common::{batch_config, theme, ts, widget};
use dashsync_sync::{BatchConfig, HandlerError, UpdateProcessor};
use dashsync_types::{merge_fields, BatchUpdate, Fields, UpdateKey};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn recorder(processor: &mut UpdateProcessor) -> Arc<Mutex<Vec<BatchUpdate>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    processor.on_update(move |batch| {
        sink.lock().unwrap().push(batch.clone());
        Ok(())
    });
    seen
}

// ── Debounce and batching ────────────────────────────────────────

#[test]
fn nothing_processed_before_delay() {
    let mut processor = UpdateProcessor::new(batch_config());
    processor.add(widget("w1", json!({"a": 1}), 0), ts(0));

    assert_eq!(processor.next_deadline(), Some(ts(100)));
    assert!(processor.poll(ts(99)).is_none());
    assert_eq!(processor.queued_len(), 1);

    let batch = processor.poll(ts(100)).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.processed_at, Some(ts(100)));
    assert!(processor.is_empty());
    assert_eq!(processor.next_deadline(), None);
}

#[test]
fn rapid_theme_changes_collapse_into_one_item() {
    let mut processor = UpdateProcessor::new(batch_config());
    let seen = recorder(&mut processor);

    let first = theme(json!({"mode": "dark"}), 0);
    let second = theme(json!({"accent": "teal"}), 30);
    let third = theme(json!({"mode": "light"}), 60);
    let last_id = third.id;
    processor.add(first, ts(0));
    processor.add(second, ts(30));
    processor.add(third, ts(60));

    assert_eq!(processor.queued_len(), 1);
    let batch = processor.poll(ts(160)).unwrap();
    assert_eq!(batch.len(), 1);

    let item = &batch.items[0];
    assert_eq!(item.id, last_id);
    assert_eq!(item.timestamp, ts(60));
    assert_eq!(item.payload.fields()["mode"], "light");
    assert_eq!(item.payload.fields()["accent"], "teal");

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(processor.stats().items_merged, 2);
}

#[test]
fn steady_stream_is_processed_by_max_delay() {
    let mut processor = UpdateProcessor::new(batch_config());
    let mut processed = None;
    for t in (0..=400).step_by(50) {
        if let Some(batch) = processor.poll(ts(t)) {
            processed = Some((t, batch));
            break;
        }
        processor.add(widget(&format!("w{t}"), json!({"t": t}), t), ts(t));
    }
    let (at, batch) = processed.expect("stream should be processed");
    assert_eq!(at, 200);
    assert_eq!(batch.len(), 4);
}

#[test]
fn full_batch_processes_immediately() {
    let config = BatchConfig {
        batch_size: 3,
        ..batch_config()
    };
    let mut processor = UpdateProcessor::new(config);
    for i in 0..3 {
        processor.add(widget(&format!("w{i}"), json!({}), 0), ts(5));
    }
    assert_eq!(processor.next_deadline(), Some(ts(5)));
    assert_eq!(processor.poll(ts(5)).unwrap().len(), 3);
}

#[test]
fn overflow_is_processed_in_follow_up_batches() {
    let config = BatchConfig {
        batch_size: 2,
        ..batch_config()
    };
    let mut processor = UpdateProcessor::new(config);
    for i in 0..5 {
        processor.add(widget(&format!("w{i}"), json!({}), i), ts(0));
    }

    let mut sizes = Vec::new();
    while let Some(batch) = processor.poll(ts(0)) {
        sizes.push(batch.len());
    }
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(processor.is_empty());
}

#[test]
fn batch_ordered_by_priority_then_timestamp() {
    let mut processor = UpdateProcessor::new(batch_config());
    processor.add(widget("low", json!({}), 10), ts(10));
    processor.add(widget("urgent", json!({}), 30).with_priority(5), ts(30));
    processor.add(widget("early", json!({}), 5), ts(31));
    processor.add(widget("high", json!({}), 20).with_priority(1), ts(32));

    let batch = processor.poll(ts(500)).unwrap();
    let order: Vec<_> = batch
        .items
        .iter()
        .map(|i| i.payload.data_id().unwrap().to_string())
        .collect();
    assert_eq!(order, vec!["urgent", "high", "early", "low"]);
}

#[test]
fn without_dedup_every_item_is_kept() {
    let config = BatchConfig {
        dedup: false,
        ..batch_config()
    };
    let mut processor = UpdateProcessor::new(config);
    processor.add(theme(json!({"mode": "dark"}), 0), ts(0));
    processor.add(theme(json!({"mode": "light"}), 1), ts(1));
    assert_eq!(processor.queued_len(), 2);
    let batches = processor.flush(ts(2));
    assert_eq!(batches.iter().map(BatchUpdate::len).sum::<usize>(), 2);
}

// ── Handlers ─────────────────────────────────────────────────────

#[test]
fn failing_handler_does_not_stop_others() {
    let mut processor = UpdateProcessor::new(batch_config());
    processor.on_update(|_| Err(HandlerError::new("render failed")));
    let seen = recorder(&mut processor);

    processor.add(widget("w1", json!({}), 0), ts(0));
    processor.poll(ts(100)).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(processor.stats().handler_errors, 1);
}

#[test]
fn panicking_handler_is_contained() {
    let mut processor = UpdateProcessor::new(batch_config());
    processor.on_update(|_| panic!("handler bug"));
    let seen = recorder(&mut processor);

    processor.add(widget("w1", json!({}), 0), ts(0));
    let batch = processor.poll(ts(100));

    assert!(batch.is_some());
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(processor.stats().handler_errors, 1);
}

#[test]
fn off_update_unregisters() {
    let mut processor = UpdateProcessor::new(batch_config());
    let seen = Arc::new(Mutex::new(0));
    let counter = seen.clone();
    let id = processor.on_update(move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });
    assert!(processor.off_update(id));
    assert!(!processor.off_update(id));

    processor.add(widget("w1", json!({}), 0), ts(0));
    processor.poll(ts(100));
    assert_eq!(*seen.lock().unwrap(), 0);
}

#[test]
fn clear_drops_queue_and_deadline() {
    let mut processor = UpdateProcessor::new(batch_config());
    processor.add(widget("w1", json!({}), 0), ts(0));
    processor.add(widget("w2", json!({}), 0), ts(0));
    assert_eq!(processor.clear(), 2);
    assert_eq!(processor.next_deadline(), None);
    assert!(processor.poll(ts(1_000)).is_none());
}

#[test]
fn stats_track_processing() {
    let mut processor = UpdateProcessor::new(batch_config());
    processor.add(widget("w1", json!({}), 0), ts(0));
    processor.add(widget("w2", json!({}), 0), ts(0));
    processor.poll(ts(100));

    let stats = processor.stats();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.batches_processed, 1);
    assert_eq!(stats.items_processed, 2);
    assert_eq!(stats.last_batch_at, Some(ts(100)));
}

// ── Properties ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn queued_items_never_wait_past_max_delay(gaps in prop::collection::vec(0u64..150, 1..40)) {
        let config = batch_config();
        let mut processor = UpdateProcessor::new(config.clone());
        let mut now = 0;
        let mut first_queued: Option<u64> = None;
        for (i, gap) in gaps.iter().enumerate() {
            now += gap;
            while processor.next_deadline().is_some_and(|d| d <= ts(now)) {
                processor.poll(ts(now));
                first_queued = None;
            }
            processor.add(widget(&format!("w{i}"), json!({"i": i}), now), ts(now));
            let first = *first_queued.get_or_insert(now);
            let deadline = processor.next_deadline().unwrap();
            prop_assert!(deadline <= ts(first + config.max_batch_delay_ms));
        }
        let total: usize = processor.flush(ts(now)).iter().map(BatchUpdate::len).sum();
        prop_assert!(total >= 1);
        prop_assert!(processor.is_empty());
    }

    #[test]
    fn merging_matches_sequential_application(
        ops in prop::collection::vec((0usize..3, 0usize..4, 0i64..100), 1..30)
    ) {
        let mut processor = UpdateProcessor::new(BatchConfig {
            batch_size: 100,
            ..batch_config()
        });
        let mut expected: HashMap<UpdateKey, Fields> = HashMap::new();
        for (i, (target, field, value)) in ops.iter().enumerate() {
            let mut item = widget(&format!("w{target}"), json!({}), i as u64);
            item.payload
                .fields_mut()
                .insert(format!("f{field}"), json!(value));
            merge_fields(expected.entry(item.key()).or_default(), item.payload.fields());
            processor.add(item, ts(i as u64));
        }

        let batches = processor.flush(ts(1_000));
        let mut actual: HashMap<UpdateKey, Fields> = HashMap::new();
        for item in batches.iter().flat_map(|b| b.items.iter()) {
            prop_assert!(actual.insert(item.key(), item.payload.fields().clone()).is_none());
        }
        prop_assert_eq!(actual, expected);
    }
}
