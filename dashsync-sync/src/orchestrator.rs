//! Sync orchestrator: drives a session over real transports.
//!
//! The orchestrator owns all I/O. The [`SyncSession`] is a pure state
//! machine; this loop feeds it commands, transport frames and timer expiries,
//! and carries out the actions it produces. UI code talks to the loop through
//! an [`OrchestratorHandle`].

use crate::clock::{Clock, TokioClock};
use crate::engine::{SessionAction, SessionSnapshot, SyncSession};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::reconciler::Resolution;
use crate::transport::{Transport, TransportEvent};
use crate::SyncConfig;
use dashsync_types::{ConflictId, OperationId, Timestamp, UpdateItem};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
const TRANSPORT_BUFFER: usize = 256;

/// Commands that can be sent to the orchestrator.
#[derive(Debug)]
pub enum SyncCommand {
    /// Apply a local mutation and send it.
    Submit {
        item: UpdateItem,
        reply: oneshot::Sender<OperationId>,
    },
    /// Settle a manual conflict.
    ResolveConflict {
        conflict_id: ConflictId,
        resolution: Resolution,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    /// Manual refresh through the polling transport.
    RequestPoll { reply: oneshot::Sender<bool> },
    /// Drain queued updates immediately; replies once they are sent.
    Flush { reply: oneshot::Sender<()> },
    /// Report the session state.
    Status {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Stop the orchestrator.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to send commands to the orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
    clock: TokioClock,
}

impl OrchestratorHandle {
    /// Current time on the session's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Subscribes to events surfaced by the session.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        response.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Applies a local mutation; returns its operation id once the view
    /// shows it.
    pub async fn submit(&self, item: UpdateItem) -> SyncResult<OperationId> {
        self.request(|reply| SyncCommand::Submit { item, reply }).await
    }

    /// Settles a manual conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> SyncResult<()> {
        self.request(|reply| SyncCommand::ResolveConflict {
            conflict_id,
            resolution,
            reply,
        })
        .await?
    }

    /// Requests a manual refresh. Returns false if throttled.
    pub async fn request_poll(&self) -> SyncResult<bool> {
        self.request(|reply| SyncCommand::RequestPoll { reply }).await
    }

    /// Drains queued updates immediately.
    pub async fn flush(&self) -> SyncResult<()> {
        self.request(|reply| SyncCommand::Flush { reply }).await
    }

    /// Returns a snapshot of the session.
    pub async fn status(&self) -> SyncResult<SessionSnapshot> {
        self.request(|reply| SyncCommand::Status { reply }).await
    }

    /// Shuts the orchestrator down and waits for teardown to finish.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|reply| SyncCommand::Shutdown { reply }).await
    }
}

/// The sync orchestrator.
pub struct SyncOrchestrator {
    session: SyncSession,
    clock: TokioClock,
    /// Push transport (WebSocket in production).
    push: Box<dyn Transport>,
    /// Fallback transport used for polling.
    poll: Box<dyn Transport>,
    /// Events from the current push connection; replaced on every dial so
    /// frames from a dead socket are never seen.
    push_rx: Option<mpsc::Receiver<TransportEvent>>,
    poll_tx: mpsc::Sender<TransportEvent>,
    poll_rx: mpsc::Receiver<TransportEvent>,
    event_tx: broadcast::Sender<SyncEvent>,
}

/// Creates an orchestrator with its own session.
///
/// Returns the handle, the command receiver to pass to
/// [`SyncOrchestrator::run`], and the orchestrator itself.
pub fn create_orchestrator(
    config: SyncConfig,
    push: Box<dyn Transport>,
    poll: Box<dyn Transport>,
) -> SyncResult<(
    OrchestratorHandle,
    mpsc::Receiver<SyncCommand>,
    SyncOrchestrator,
)> {
    let clock = TokioClock::new();
    let session = SyncSession::new(config, Arc::new(clock.clone()))?;
    Ok(create_orchestrator_with_session(session, clock, push, poll))
}

/// Creates an orchestrator around an existing session. The session must
/// read time from `clock`.
pub fn create_orchestrator_with_session(
    session: SyncSession,
    clock: TokioClock,
    push: Box<dyn Transport>,
    poll: Box<dyn Transport>,
) -> (
    OrchestratorHandle,
    mpsc::Receiver<SyncCommand>,
    SyncOrchestrator,
) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let (poll_tx, poll_rx) = mpsc::channel(TRANSPORT_BUFFER);

    let handle = OrchestratorHandle {
        command_tx,
        event_tx: event_tx.clone(),
        clock: clock.clone(),
    };
    let orchestrator = SyncOrchestrator {
        session,
        clock,
        push,
        poll,
        push_rx: None,
        poll_tx,
        poll_rx,
        event_tx,
    };
    (handle, command_rx, orchestrator)
}

async fn recv_push(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SyncOrchestrator {
    /// Spawns the loop on the current runtime.
    pub fn spawn(
        self,
        command_rx: mpsc::Receiver<SyncCommand>,
    ) -> tokio::task::JoinHandle<SyncResult<()>> {
        tokio::spawn(self.run(command_rx))
    }

    /// Runs the orchestrator loop until shutdown or until every handle is
    /// dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SyncCommand>) -> SyncResult<()> {
        if let Err(e) = self.poll.open(self.poll_tx.clone()).await {
            warn!("Polling transport unavailable: {}", e);
        }
        self.session.start();
        info!("Sync orchestrator started");

        loop {
            self.session.poll();
            self.perform_actions().await;
            self.publish_events();

            let deadline = self
                .session
                .next_deadline()
                .map(|at| self.clock.instant_at(at));

            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("All orchestrator handles dropped");
                        self.teardown().await;
                        break;
                    };
                    if let SyncCommand::Shutdown { reply } = command {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    self.handle_command(command).await;
                }

                event = recv_push(&mut self.push_rx) => match event {
                    Some(event) => self.handle_push_event(event),
                    None => {
                        self.push_rx = None;
                        self.session.on_transport_closed("transport channel closed");
                    }
                },

                Some(event) = self.poll_rx.recv() => {
                    if let TransportEvent::Message(frame) = event {
                        self.session.on_transport_message(&frame);
                    }
                }

                () = sleep_until(deadline) => {}
            }
        }

        info!("Sync orchestrator stopped");
        Ok(())
    }

    async fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Submit { item, reply } => {
                let id = self.session.submit(item);
                let _ = reply.send(id);
            }
            SyncCommand::ResolveConflict {
                conflict_id,
                resolution,
                reply,
            } => {
                let _ = reply.send(self.session.resolve_conflict(conflict_id, resolution));
            }
            SyncCommand::RequestPoll { reply } => {
                let _ = reply.send(self.session.request_poll());
            }
            SyncCommand::Flush { reply } => {
                self.session.flush();
                self.perform_actions().await;
                let _ = reply.send(());
            }
            SyncCommand::Status { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            SyncCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_push_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(frame) => self.session.on_transport_message(&frame),
            TransportEvent::Closed { reason } => {
                debug!("Push transport closed: {}", reason);
                self.push_rx = None;
                self.session.on_transport_closed(&reason);
            }
        }
    }

    /// Carries out session actions until the session stops producing them.
    async fn perform_actions(&mut self) {
        loop {
            let actions = self.session.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                self.perform(action).await;
            }
        }
    }

    async fn perform(&mut self, action: SessionAction) {
        match action {
            SessionAction::Dial => {
                let (tx, rx) = mpsc::channel(TRANSPORT_BUFFER);
                match self.push.open(tx).await {
                    Ok(()) => {
                        self.push_rx = Some(rx);
                        self.session.on_transport_open();
                    }
                    Err(e) => {
                        warn!("Dial failed: {}", e);
                        self.session.on_transport_closed(&e.to_string());
                    }
                }
            }
            SessionAction::Send(message) => {
                if let Err(e) = self.push.send(&message).await {
                    warn!("Send of {} failed: {}", message.message_type, e);
                    self.close_push().await;
                    self.session.on_transport_closed(&e.to_string());
                }
            }
            SessionAction::ForceClose => self.close_push().await,
            SessionAction::Poll => match self.poll.poll_once().await {
                Ok(frames) => {
                    debug!("Poll delivered {} messages", frames.len());
                    for frame in &frames {
                        self.session.on_transport_message(frame);
                    }
                }
                Err(e) => warn!("Poll failed: {}", e),
            },
        }
    }

    async fn close_push(&mut self) {
        self.push_rx = None;
        if let Err(e) = self.push.close().await {
            debug!("Closing push transport: {}", e);
        }
    }

    fn publish_events(&mut self) {
        for event in self.session.drain_events() {
            // No subscribers is not an error.
            let _ = self.event_tx.send(event);
        }
    }

    async fn teardown(&mut self) {
        self.session.shutdown();
        self.perform_actions().await;
        self.close_push().await;
        if let Err(e) = self.poll.close().await {
            debug!("Closing poll transport: {}", e);
        }
        self.publish_events();
    }
}
