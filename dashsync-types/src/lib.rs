//! Core data model for dashsync.
//!
//! This crate defines the plain data exchanged between the engine's
//! components and over the wire:
//! - Identifiers (UUID v7 for generated ids, strings for devices)
//! - Millisecond timestamps
//! - Update items, their typed payloads and dedup keys, and batches
//! - Devices and durable cross-device change records
//!
//! Nothing here performs I/O or keeps time; see `dashsync-sync` for the
//! engine itself.

mod device;
mod ids;
mod timestamp;
mod update;

pub use device::{ChangeType, Device, SyncChange};
pub use ids::{BatchId, ChangeId, ConflictId, DeviceId, OperationId, UpdateId};
pub use timestamp::Timestamp;
pub use update::{
    into_fields, merge_fields, BatchUpdate, Fields, UpdateItem, UpdateKey, UpdatePayload,
    GLOBAL_TARGET,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("{kind} update is missing its `{field}` target")]
    MissingTarget { kind: String, field: &'static str },

    #[error("invalid update payload: {0}")]
    InvalidPayload(String),
}
