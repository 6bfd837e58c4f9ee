//! Injectable time sources.
//!
//! Components never read the system clock themselves. They take a
//! `Timestamp` from a [`Clock`] and expose deadlines, so the same logic runs
//! against wall time in production and a virtual clock in tests.

use dashsync_types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Reads the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Wall time anchored at construction and advanced by the tokio timer.
///
/// Under `tokio::time::pause` this clock moves only when the runtime's
/// virtual time does, which keeps timer-driven tests deterministic.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    origin_wall: Timestamp,
}

impl TokioClock {
    /// Anchors a clock at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(Timestamp::now())
    }

    /// Anchors a clock at an explicit wall time.
    #[must_use]
    pub fn anchored_at(origin_wall: Timestamp) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_wall,
        }
    }

    /// Converts a timestamp from this clock into a tokio instant.
    #[must_use]
    pub fn instant_at(&self, at: Timestamp) -> tokio::time::Instant {
        self.origin + at.since(self.origin_wall)
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.origin_wall.add(self.origin.elapsed())
    }
}

/// A virtual clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Moves the clock forward by `millis` milliseconds.
    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;
