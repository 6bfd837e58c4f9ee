//! Engine configuration.
//!
//! Every section has defaults and `#[serde(default)]`, so a JSON document
//! only needs the values it overrides:
//!
//! ```
//! use dashsync_sync::SyncConfig;
//!
//! let config = SyncConfig::from_json_str(r#"{"batch": {"batch_size": 25}}"#).unwrap();
//! assert_eq!(config.batch.batch_size, 25);
//! assert_eq!(config.connection.reconnect_attempts, 5);
//! ```

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

/// How a local pending operation and a conflicting remote update are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Discard the local optimistic effect and apply the remote value.
    #[default]
    RemoteWins,
    /// Keep the local value and hold the remote one until the local confirms.
    LocalWins,
    /// Surface both values to the caller and apply neither automatically.
    Manual,
}

/// WebSocket lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Push endpoint.
    pub url: String,
    /// Reconnect attempts before giving up.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect (ms).
    pub reconnect_delay_ms: u64,
    /// Growth factor between consecutive reconnect delays.
    pub backoff_multiplier: f64,
    /// Upper bound on any single reconnect delay (ms).
    pub max_reconnect_delay_ms: u64,
    /// Interval between pings while open (ms).
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a pong before forcing a reconnect (ms).
    pub heartbeat_timeout_ms: u64,
    /// How long an outbound request may wait for its ack (ms).
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/api/realtime".to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            request_timeout_ms: 10_000,
        }
    }
}

/// Update processor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per batch; reaching it processes immediately.
    pub batch_size: usize,
    /// Quiet period after the last arrival before a batch is processed (ms).
    pub batch_delay_ms: u64,
    /// Hard cap on how long the first queued item may wait (ms).
    pub max_batch_delay_ms: u64,
    /// Collapse items with the same key while queued.
    pub dedup: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_ms: 100,
            max_batch_delay_ms: 200,
            dedup: true,
        }
    }
}

/// Optimistic reconciler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// How long an optimistic operation may stay unacknowledged (ms).
    pub optimistic_timeout_ms: u64,
    /// Interval of the expiry sweep (ms).
    pub sweep_interval_ms: u64,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
    /// How long conflicts are retained before being discarded (ms).
    pub conflict_retention_ms: u64,
    /// Settled operations remembered for duplicate-ack detection.
    pub settled_history: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            optimistic_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
            conflict_strategy: ConflictStrategy::RemoteWins,
            conflict_retention_ms: 300_000,
            settled_history: 1_024,
        }
    }
}

/// Background sync coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Polling endpoint used while the socket is not open.
    pub poll_url: String,
    /// Maximum retry queue length.
    pub queue_capacity: usize,
    /// Attempts per queued operation before it is reported failed.
    pub retry_attempts: u32,
    /// Delay before the first retry (ms).
    pub retry_delay_ms: u64,
    /// Growth factor between consecutive retries.
    pub retry_multiplier: f64,
    /// Interval between fallback polls (ms).
    pub poll_interval_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            poll_url: "http://localhost:3000/api/realtime/poll".to_string(),
            queue_capacity: 100,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            retry_multiplier: 2.0,
            poll_interval_ms: 30_000,
        }
    }
}

/// Cache TTLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Widget data TTL (ms).
    pub widget_ttl_ms: u64,
    /// Layout TTL (ms).
    pub layout_ttl_ms: u64,
    /// Dashboard state TTL (ms).
    pub state_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            widget_ttl_ms: 300_000,
            layout_ttl_ms: 600_000,
            state_ttl_ms: 60_000,
        }
    }
}

/// Configuration for a sync session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push connection.
    pub connection: ConnectionConfig,
    /// Update batching.
    pub batch: BatchConfig,
    /// Optimistic reconciliation.
    pub reconciler: ReconcilerConfig,
    /// Retry queue and polling.
    pub background: BackgroundConfig,
    /// Cache TTLs.
    pub cache: CacheConfig,
}

impl SyncConfig {
    /// Parses a (possibly partial) JSON configuration and validates it.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the values can drive the engine.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.batch.max_batch_delay_ms < self.batch.batch_delay_ms {
            return Err(SyncError::Config(format!(
                "max_batch_delay_ms ({}) is below batch_delay_ms ({})",
                self.batch.max_batch_delay_ms, self.batch.batch_delay_ms
            )));
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(SyncError::Config(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.background.retry_multiplier < 1.0 {
            return Err(SyncError::Config(
                "retry_multiplier must be at least 1.0".into(),
            ));
        }
        if self.background.queue_capacity == 0 {
            return Err(SyncError::Config("queue_capacity must be at least 1".into()));
        }
        if self.connection.heartbeat_timeout_ms == 0 {
            return Err(SyncError::Config(
                "heartbeat_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff: `base × multiplier^exponent`, capped at `cap`.
pub(crate) fn backoff_delay(base_ms: u64, multiplier: f64, exponent: u32, cap_ms: u64) -> u64 {
    let factor = multiplier.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
    let delay = (base_ms as f64) * factor;
    if !delay.is_finite() || delay >= cap_ms as f64 {
        cap_ms
    } else {
        delay.round() as u64
    }
}
