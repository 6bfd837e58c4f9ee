//! Realtime connection manager.
//!
//! Tracks the push connection's lifecycle without touching a socket:
//!
//! ```text
//! Closed ─connect─▶ Connecting ─open─▶ Open
//!                      ▲                 │ close / heartbeat timeout
//!                      └── Reconnecting ◀┘
//!                              │ attempts exhausted
//!                              ▼
//!                            Closed
//! ```
//!
//! Every transition returns the [`ConnectionAction`]s the I/O driver must
//! carry out. Timers (reconnect backoff, heartbeat, request deadlines) are
//! exposed through [`ConnectionManager::next_deadline`] and fired by
//! [`ConnectionManager::poll`].

use crate::background::QueuedOperation;
use crate::config::{backoff_delay, ConnectionConfig};
use crate::protocol::WireMessage;
use dashsync_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected; either never started, disconnected, or gave up.
    #[default]
    Closed,
    /// Dialing.
    Connecting,
    /// Connected and healthy.
    Open,
    /// Waiting for the backoff delay before dialing again.
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Snapshot of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed connections; reset to 0 on every open.
    pub attempt: u32,
    pub last_heartbeat_at: Option<Timestamp>,
}

/// An outbound request awaiting its acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightRequest {
    /// Correlation id carried by the request message.
    pub message_id: String,
    /// The operations the request carried.
    pub operations: Vec<QueuedOperation>,
    pub sent_at: Timestamp,
    pub deadline: Timestamp,
}

/// Side effects requested by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Open the push transport.
    Dial { attempt: u32 },
    /// Send a control message (heartbeat).
    Send(WireMessage),
    /// Close the push transport.
    Close,
    /// The status changed.
    StatusChanged {
        status: ConnectionStatus,
        attempt: u32,
    },
    /// A reconnect was scheduled.
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Reconnecting gave up.
    Exhausted { attempts: u32 },
    /// Requests that will not be acknowledged on this connection; hand their
    /// operations back to the retry queue.
    Requeue(Vec<InFlightRequest>),
    /// A request outlived its deadline.
    RequestTimedOut(InFlightRequest),
}

/// WebSocket lifecycle state machine.
pub struct ConnectionManager {
    config: ConnectionConfig,
    status: ConnectionStatus,
    attempt: u32,
    last_heartbeat_at: Option<Timestamp>,
    reconnect_at: Option<Timestamp>,
    next_ping_at: Option<Timestamp>,
    in_flight: HashMap<String, InFlightRequest>,
}

impl ConnectionManager {
    /// Creates a closed connection manager.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Closed,
            attempt: 0,
            last_heartbeat_at: None,
            reconnect_at: None,
            next_ping_at: None,
            in_flight: HashMap::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Snapshot of the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            status: self.status,
            attempt: self.attempt,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }

    /// Whether messages may be sent right now.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.status == ConnectionStatus::Open
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base × multiplier^(attempt-1)`, capped.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> u64 {
        backoff_delay(
            self.config.reconnect_delay_ms,
            self.config.backoff_multiplier,
            attempt.saturating_sub(1),
            self.config.max_reconnect_delay_ms,
        )
    }

    fn transition(&mut self, status: ConnectionStatus, actions: &mut Vec<ConnectionAction>) {
        if self.status != status {
            debug!("Connection {} -> {}", self.status, status);
            self.status = status;
            actions.push(ConnectionAction::StatusChanged {
                status,
                attempt: self.attempt,
            });
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts connecting. No-op unless closed.
    pub fn connect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.status != ConnectionStatus::Closed {
            return actions;
        }
        info!("Connecting to {}", self.config.url);
        self.attempt = 0;
        self.transition(ConnectionStatus::Connecting, &mut actions);
        actions.push(ConnectionAction::Dial { attempt: 0 });
        actions
    }

    /// The transport opened.
    pub fn on_open(&mut self, now: Timestamp) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.status != ConnectionStatus::Connecting {
            warn!("Ignoring open while {}", self.status);
            return actions;
        }
        info!("Connected to {}", self.config.url);
        self.attempt = 0;
        self.reconnect_at = None;
        self.last_heartbeat_at = Some(now);
        self.next_ping_at = Some(now.add_millis(self.config.heartbeat_interval_ms));
        self.transition(ConnectionStatus::Open, &mut actions);
        actions
    }

    /// The transport closed or failed to open.
    ///
    /// Schedules a reconnect with exponential backoff while attempts remain;
    /// otherwise gives up. Closes reported while not connecting or open are
    /// ignored (they follow a close this manager already handled).
    pub fn on_close(&mut self, now: Timestamp, reason: &str) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if !matches!(
            self.status,
            ConnectionStatus::Open | ConnectionStatus::Connecting
        ) {
            debug!("Ignoring close while {}: {}", self.status, reason);
            return actions;
        }
        warn!("Connection closed: {}", reason);
        self.handle_loss(now, &mut actions);
        actions
    }

    fn handle_loss(&mut self, now: Timestamp, actions: &mut Vec<ConnectionAction>) {
        self.stop_heartbeat();
        self.requeue_in_flight(actions);

        if self.attempt < self.config.reconnect_attempts {
            self.attempt += 1;
            let delay_ms = self.reconnect_delay(self.attempt);
            self.reconnect_at = Some(now.add_millis(delay_ms));
            self.transition(ConnectionStatus::Reconnecting, actions);
            info!(
                "Reconnecting in {}ms (attempt {}/{})",
                delay_ms, self.attempt, self.config.reconnect_attempts
            );
            actions.push(ConnectionAction::ReconnectScheduled {
                attempt: self.attempt,
                delay_ms,
            });
        } else {
            let attempts = self.attempt;
            error!("Giving up after {} reconnect attempts", attempts);
            self.reconnect_at = None;
            self.transition(ConnectionStatus::Closed, actions);
            actions.push(ConnectionAction::Exhausted { attempts });
        }
    }

    /// A pong (or any proof of life) arrived.
    pub fn on_pong(&mut self, now: Timestamp) {
        if self.status == ConnectionStatus::Open {
            self.last_heartbeat_at = Some(now);
        }
    }

    /// Closes deliberately; no reconnect follows. Outstanding requests are
    /// handed back for retry.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.status == ConnectionStatus::Closed {
            return actions;
        }
        info!("Disconnecting from {}", self.config.url);
        let was_live = matches!(
            self.status,
            ConnectionStatus::Open | ConnectionStatus::Connecting
        );
        self.stop_heartbeat();
        self.reconnect_at = None;
        self.attempt = 0;
        self.requeue_in_flight(&mut actions);
        self.transition(ConnectionStatus::Closed, &mut actions);
        if was_live {
            actions.push(ConnectionAction::Close);
        }
        actions
    }

    fn stop_heartbeat(&mut self) {
        self.next_ping_at = None;
    }

    fn requeue_in_flight(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.in_flight.is_empty() {
            return;
        }
        let mut requests: Vec<InFlightRequest> =
            self.in_flight.drain().map(|(_, request)| request).collect();
        requests.sort_by_key(|r| r.sent_at);
        actions.push(ConnectionAction::Requeue(requests));
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Records a request sent with correlation id `message_id`.
    pub fn track_request(
        &mut self,
        message_id: impl Into<String>,
        operations: Vec<QueuedOperation>,
        now: Timestamp,
    ) {
        let message_id = message_id.into();
        self.in_flight.insert(
            message_id.clone(),
            InFlightRequest {
                message_id,
                operations,
                sent_at: now,
                deadline: now.add_millis(self.config.request_timeout_ms),
            },
        );
    }

    /// Removes and returns the request a response correlates to.
    pub fn resolve_request(&mut self, message_id: &str) -> Option<InFlightRequest> {
        self.in_flight.remove(message_id)
    }

    /// Number of requests awaiting acknowledgement.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Earliest time [`poll`](Self::poll) has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let heartbeat_deadline = match self.status {
            ConnectionStatus::Open => self
                .last_heartbeat_at
                .map(|at| at.add_millis(self.config.heartbeat_timeout_ms)),
            _ => None,
        };
        [
            self.reconnect_at,
            self.next_ping_at,
            heartbeat_deadline,
            self.in_flight.values().map(|r| r.deadline).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fires every timer due at `now`.
    pub fn poll(&mut self, now: Timestamp) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        let mut expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        for id in expired {
            if let Some(request) = self.in_flight.remove(&id) {
                warn!("Request {} timed out", request.message_id);
                actions.push(ConnectionAction::RequestTimedOut(request));
            }
        }

        match self.status {
            ConnectionStatus::Reconnecting => {
                if self.reconnect_at.is_some_and(|at| at <= now) {
                    self.reconnect_at = None;
                    self.transition(ConnectionStatus::Connecting, &mut actions);
                    actions.push(ConnectionAction::Dial {
                        attempt: self.attempt,
                    });
                }
            }
            ConnectionStatus::Open => {
                let silent_since = self.last_heartbeat_at.unwrap_or(now);
                if now.since(silent_since).as_millis()
                    >= u128::from(self.config.heartbeat_timeout_ms)
                {
                    warn!(
                        "No pong for {}ms, forcing reconnect",
                        self.config.heartbeat_timeout_ms
                    );
                    actions.push(ConnectionAction::Close);
                    self.handle_loss(now, &mut actions);
                } else if self.next_ping_at.is_some_and(|at| at <= now) {
                    self.next_ping_at = Some(now.add_millis(self.config.heartbeat_interval_ms));
                    actions.push(ConnectionAction::Send(WireMessage::ping(now)));
                }
            }
            ConnectionStatus::Closed | ConnectionStatus::Connecting => {}
        }

        actions
    }
}
