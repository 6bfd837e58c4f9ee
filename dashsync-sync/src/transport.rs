//! Transport layer abstraction.
//!
//! A [`Transport`] moves text frames between the engine and the server.
//! Pushed frames and lifecycle changes go into the channel handed to
//! [`Transport::open`]; polled frames are returned by
//! [`Transport::poll_once`]. Both end up in the same session pipeline, so
//! consumers cannot tell them apart.

use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A raw text frame arrived.
    Message(String),
    /// The connection ended.
    Closed { reason: String },
}

/// Sender half handed to a transport.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Which strategy a transport implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    HttpPoll,
}

/// A bidirectional message transport.
#[async_trait]
pub trait Transport: Send {
    /// Which strategy this is.
    fn kind(&self) -> TransportKind;

    /// Connects and starts forwarding inbound frames into `events`.
    async fn open(&mut self, events: EventSender) -> SyncResult<()>;

    /// Sends one message.
    async fn send(&mut self, message: &WireMessage) -> SyncResult<()>;

    /// Disconnects. Closing a closed transport is not an error.
    async fn close(&mut self) -> SyncResult<()>;

    /// Fetches pending server messages once and returns the raw frames.
    ///
    /// Frames are handed back to the caller rather than written to the event
    /// channel, whose only reader is usually the task awaiting this call.
    async fn poll_once(&mut self) -> SyncResult<Vec<String>> {
        Err(SyncError::Connection(format!(
            "{:?} transport does not poll",
            self.kind()
        )))
    }
}

// ── WebSocket ────────────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Push transport over a WebSocket.
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
    writer: Option<futures::stream::SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Creates a transport for `url`; dialing gives up after `connect_timeout`.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            writer: None,
            reader: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&mut self, events: EventSender) -> SyncResult<()> {
        self.close().await?;

        let (stream, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| SyncError::Timeout)??;
        let (writer, mut reader) = stream.split();
        debug!("WebSocket connected to {}", self.url);

        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frame = TransportEvent::Message(text.as_str().to_owned());
                        if events.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_owned())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = events.send(TransportEvent::Closed { reason }).await;
        });

        self.writer = Some(writer);
        self.reader = Some(reader_task);
        Ok(())
    }

    async fn send(&mut self, message: &WireMessage) -> SyncResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SyncError::Connection("websocket not connected".into()));
        };
        let json = message.to_json()?;
        writer.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                debug!("WebSocket close: {}", e);
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Ok(())
    }
}

// ── HTTP polling ─────────────────────────────────────────────────

/// Fallback transport over plain HTTP.
///
/// `poll_once` GETs the poll endpoint, which answers with one wire message
/// or a JSON array of them. `send` POSTs a message and forwards any reply
/// body as an inbound frame.
pub struct HttpPollTransport {
    client: reqwest::Client,
    url: String,
    events: Option<EventSender>,
}

impl HttpPollTransport {
    /// Creates a transport for the poll endpoint `url`.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    /// Creates a transport sharing an existing client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            events: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn sender(&self) -> SyncResult<&EventSender> {
        self.events
            .as_ref()
            .ok_or_else(|| SyncError::Connection("poll transport not open".into()))
    }

    /// Splits a response body into wire frames: one message or an array.
    fn frames(body: &str) -> Vec<String> {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(messages)) => messages.iter().map(Value::to_string).collect(),
            Ok(Value::Null) => Vec::new(),
            _ if body.trim().is_empty() => Vec::new(),
            _ => vec![body.to_string()],
        }
    }
}

#[async_trait]
impl Transport for HttpPollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpPoll
    }

    async fn open(&mut self, events: EventSender) -> SyncResult<()> {
        self.events = Some(events);
        Ok(())
    }

    async fn send(&mut self, message: &WireMessage) -> SyncResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        let frames = Self::frames(&body);
        if frames.is_empty() {
            return Ok(());
        }
        // Replies are forwarded off-task; the reader may be the caller.
        let events = self.sender()?.clone();
        tokio::spawn(async move {
            for frame in frames {
                if events.send(TransportEvent::Message(frame)).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.events = None;
        Ok(())
    }

    async fn poll_once(&mut self) -> SyncResult<Vec<String>> {
        self.sender()?;
        let response = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        let frames = Self::frames(&body);
        if !frames.is_empty() {
            debug!("Poll returned {} messages", frames.len());
        }
        Ok(frames)
    }
}

/// A scriptable in-memory transport for tests.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    #[derive(Debug, Default)]
    struct MockState {
        sent: Vec<WireMessage>,
        events: Option<EventSender>,
        failing_dials: u32,
        dials: u32,
        closes: u32,
        polls: u32,
        poll_responses: VecDeque<Vec<String>>,
    }

    /// A transport whose peer is the test.
    ///
    /// Clones share state, so a test keeps one handle while the engine owns
    /// another.
    #[derive(Debug, Clone)]
    pub struct MockTransport {
        kind: TransportKind,
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        /// Creates a mock of the given kind.
        pub fn new(kind: TransportKind) -> Self {
            Self {
                kind,
                state: Arc::new(Mutex::new(MockState::default())),
            }
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Makes the next `n` dials fail.
        pub fn fail_next_dials(&self, n: u32) {
            self.state().failing_dials = n;
        }

        /// Queues the frames returned by the next poll.
        pub fn queue_poll_response(&self, frames: Vec<String>) {
            self.state().poll_responses.push_back(frames);
        }

        /// Messages sent so far.
        pub fn sent(&self) -> Vec<WireMessage> {
            self.state().sent.clone()
        }

        /// Takes the messages sent so far.
        pub fn take_sent(&self) -> Vec<WireMessage> {
            std::mem::take(&mut self.state().sent)
        }

        pub fn dial_count(&self) -> u32 {
            self.state().dials
        }

        pub fn close_count(&self) -> u32 {
            self.state().closes
        }

        pub fn poll_count(&self) -> u32 {
            self.state().polls
        }

        /// Whether the transport is currently open.
        pub fn is_open(&self) -> bool {
            self.state().events.is_some()
        }

        /// Delivers a frame as if the server sent it.
        pub async fn deliver(&self, frame: impl Into<String>) -> SyncResult<()> {
            let events = self
                .state()
                .events
                .clone()
                .ok_or_else(|| SyncError::Connection("mock transport not open".into()))?;
            events
                .send(TransportEvent::Message(frame.into()))
                .await
                .map_err(|_| SyncError::ChannelClosed)
        }

        /// Delivers a wire message as if the server sent it.
        pub async fn deliver_message(&self, message: &WireMessage) -> SyncResult<()> {
            self.deliver(message.to_json()?).await
        }

        /// Drops the connection as if the server went away.
        pub async fn drop_connection(&self, reason: &str) -> SyncResult<()> {
            let events = self.state().events.take();
            match events {
                Some(events) => events
                    .send(TransportEvent::Closed {
                        reason: reason.to_string(),
                    })
                    .await
                    .map_err(|_| SyncError::ChannelClosed),
                None => Err(SyncError::Connection("mock transport not open".into())),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn open(&mut self, events: EventSender) -> SyncResult<()> {
            let mut state = self.state();
            state.dials += 1;
            if state.failing_dials > 0 {
                state.failing_dials -= 1;
                warn!("Mock dial {} refused", state.dials);
                return Err(SyncError::Connection("connection refused".into()));
            }
            state.events = Some(events);
            Ok(())
        }

        async fn send(&mut self, message: &WireMessage) -> SyncResult<()> {
            let mut state = self.state();
            if state.events.is_none() {
                return Err(SyncError::Connection("mock transport not open".into()));
            }
            state.sent.push(message.clone());
            Ok(())
        }

        async fn close(&mut self) -> SyncResult<()> {
            let mut state = self.state();
            if state.events.take().is_some() {
                state.closes += 1;
            }
            Ok(())
        }

        async fn poll_once(&mut self) -> SyncResult<Vec<String>> {
            let mut state = self.state();
            state.polls += 1;
            if state.events.is_none() {
                return Err(SyncError::Connection("mock transport not open".into()));
            }
            Ok(state.poll_responses.pop_front().unwrap_or_default())
        }
    }
}
