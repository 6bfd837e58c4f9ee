//! Debounce and throttle primitives.
//!
//! Both are deadline calculators driven by explicit timestamps. They never
//! spawn timers; the owner asks for the next deadline, sleeps however it
//! likes, and calls back with the current time.

use dashsync_types::Timestamp;
use std::time::Duration;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Trailing-edge debounce with an optional hard cap on total wait.
///
/// Each [`call`](Self::call) pushes the deadline out to `last call + delay`,
/// but never beyond `first call + max_wait`, so a steady stream of calls
/// still fires.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay_ms: u64,
    max_wait_ms: Option<u64>,
    first_call: Option<Timestamp>,
    last_call: Option<Timestamp>,
    forced_at: Option<Timestamp>,
}

impl Debounce {
    /// Creates a debounce with no cap.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_ms: millis(delay),
            max_wait_ms: None,
            first_call: None,
            last_call: None,
            forced_at: None,
        }
    }

    /// Caps how long the first pending call may wait.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = Some(millis(max_wait));
        self
    }

    /// Records a call at `now`.
    pub fn call(&mut self, now: Timestamp) {
        if self.first_call.is_none() {
            self.first_call = Some(now);
        }
        self.last_call = Some(now);
    }

    /// Makes the debounce due at `now` regardless of later calls.
    pub fn trigger_now(&mut self, now: Timestamp) {
        if self.first_call.is_none() {
            self.first_call = Some(now);
        }
        self.forced_at = Some(self.forced_at.map_or(now, |at| at.min(now)));
    }

    /// When the pending call fires, if one is pending.
    #[must_use]
    pub fn deadline(&self) -> Option<Timestamp> {
        if let Some(forced) = self.forced_at {
            return Some(forced);
        }
        let trailing = self.last_call?.add_millis(self.delay_ms);
        match (self.first_call, self.max_wait_ms) {
            (Some(first), Some(max_wait)) => Some(trailing.min(first.add_millis(max_wait))),
            _ => Some(trailing),
        }
    }

    /// Whether a call is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.first_call.is_some()
    }

    /// Whether the pending call should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Fires and resets if due; returns whether it fired.
    pub fn fire_if_due(&mut self, now: Timestamp) -> bool {
        if self.is_due(now) {
            self.cancel();
            true
        } else {
            false
        }
    }

    /// Drops the pending call.
    pub fn cancel(&mut self) {
        self.first_call = None;
        self.last_call = None;
        self.forced_at = None;
    }
}

/// Leading-edge throttle: at most one firing per interval.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval_ms: u64,
    last_fired: Option<Timestamp>,
}

impl Throttle {
    /// Creates a throttle that allows one firing per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: millis(interval),
            last_fired: None,
        }
    }

    /// Fires if the interval has elapsed since the last firing.
    pub fn try_fire(&mut self, now: Timestamp) -> bool {
        match self.next_allowed() {
            Some(next) if now < next => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }

    /// Earliest time the next firing is allowed; `None` if allowed now.
    #[must_use]
    pub fn next_allowed(&self) -> Option<Timestamp> {
        self.last_fired.map(|at| at.add_millis(self.interval_ms))
    }

    /// Forgets the last firing.
    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}
