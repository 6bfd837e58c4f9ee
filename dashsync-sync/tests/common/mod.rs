//! Shared helpers for dashsync-sync integration tests.

#![allow(dead_code)]

use dashsync_sync::{BatchConfig, ConnectionConfig, ManualClock, ReconcilerConfig, SyncConfig};
use dashsync_types::{Timestamp, UpdateItem, UpdatePayload};
use serde_json::Value;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes engine logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub const T0: u64 = 1_700_000_000_000;

pub fn ts(offset_ms: u64) -> Timestamp {
    Timestamp::from_millis(T0 + offset_ms)
}

pub fn manual_clock() -> ManualClock {
    ManualClock::new(ts(0))
}

pub fn widget(id: &str, fields: Value, offset_ms: u64) -> UpdateItem {
    UpdateItem::at(UpdatePayload::widget(id, fields), ts(offset_ms))
}

pub fn theme(fields: Value, offset_ms: u64) -> UpdateItem {
    UpdateItem::at(UpdatePayload::theme(fields), ts(offset_ms))
}

pub fn batch_config() -> BatchConfig {
    BatchConfig {
        batch_size: 10,
        batch_delay_ms: 100,
        max_batch_delay_ms: 200,
        dedup: true,
    }
}

pub fn reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig::default()
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://test.invalid/realtime".to_string(),
        ..ConnectionConfig::default()
    }
}

pub fn sync_config() -> SyncConfig {
    SyncConfig {
        connection: connection_config(),
        batch: batch_config(),
        ..SyncConfig::default()
    }
}
