//! TTL cache for widget data, layouts and dashboard state.
//!
//! An entry is served until its kind's TTL runs out or it is invalidated;
//! after that the next read goes back to the source.

use crate::config::CacheConfig;
use crate::error::SyncResult;
use dashsync_types::{Timestamp, UpdateItem, UpdatePayload};
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// What a cached entry holds; each kind has its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Widget,
    Layout,
    State,
}

/// Cache key: a kind plus an entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub id: String,
}

impl CacheKey {
    pub fn new(kind: CacheKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// The cache entry an update makes stale, if any.
    #[must_use]
    pub fn for_update(item: &UpdateItem) -> Option<Self> {
        match &item.payload {
            UpdatePayload::Widget { widget_id, .. } => Some(Self::new(CacheKind::Widget, widget_id)),
            UpdatePayload::Layout { layout_id, .. } => Some(Self::new(CacheKind::Layout, layout_id)),
            UpdatePayload::Dashboard { dashboard_id, .. } => {
                Some(Self::new(CacheKind::State, dashboard_id))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Timestamp,
}

/// Per-kind TTL cache.
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    config: CacheConfig,
    entries: HashMap<CacheKey, Entry<V>>,
}

impl<V: Clone> TtlCache<V> {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// TTL for a kind, in milliseconds.
    #[must_use]
    pub fn ttl_ms(&self, kind: CacheKind) -> u64 {
        match kind {
            CacheKind::Widget => self.config.widget_ttl_ms,
            CacheKind::Layout => self.config.layout_ttl_ms,
            CacheKind::State => self.config.state_ttl_ms,
        }
    }

    /// Returns a fresh entry; expired entries are evicted.
    pub fn get(&mut self, key: &CacheKey, now: Timestamp) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                debug!("Cache entry {:?}/{} expired", key.kind, key.id);
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores a value stamped with its kind's TTL.
    pub fn insert(&mut self, key: CacheKey, value: V, now: Timestamp) {
        let expires_at = now.add_millis(self.ttl_ms(key.kind));
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Drops one entry. Returns whether it was present.
    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drops every entry of a kind.
    pub fn invalidate_kind(&mut self, kind: CacheKind) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.kind != kind);
        before - self.entries.len()
    }

    /// Drops the entry a remote update makes stale.
    pub fn invalidate_for(&mut self, item: &UpdateItem) -> bool {
        CacheKey::for_update(item).is_some_and(|key| self.invalidate(&key))
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored (possibly expired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serves a fresh entry, or runs `fetch`, stores its result and serves
    /// that. A failed fetch leaves the cache untouched.
    pub async fn get_or_fetch<F, Fut>(
        &mut self,
        key: CacheKey,
        now: Timestamp,
        fetch: F,
    ) -> SyncResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<V>>,
    {
        if let Some(value) = self.get(&key, now) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.insert(key, value.clone(), now);
        Ok(value)
    }
}
