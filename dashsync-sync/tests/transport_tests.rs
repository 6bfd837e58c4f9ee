mod common;

use common::ts;
use dashsync_sync::transport::mock::MockTransport;
use dashsync_sync::{
    HttpPollTransport, MessageType, SyncError, Transport, TransportEvent, TransportKind,
    WebSocketTransport, WireMessage,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn poll_transport(server: &MockServer) -> HttpPollTransport {
    HttpPollTransport::new(format!("{}/poll", server.uri()), Duration::from_secs(5)).unwrap()
}

fn drain(rx: &mut mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn message_types(events: &[TransportEvent]) -> Vec<MessageType> {
    events
        .iter()
        .filter_map(|e| match e {
            TransportEvent::Message(frame) => WireMessage::parse(frame).ok(),
            TransportEvent::Closed { .. } => None,
        })
        .map(|m| m.message_type)
        .collect()
}

fn frame_types(frames: &[String]) -> Vec<MessageType> {
    frames
        .iter()
        .filter_map(|frame| WireMessage::parse(frame).ok())
        .map(|m| m.message_type)
        .collect()
}

// ── HTTP polling ─────────────────────────────────────────────────

#[tokio::test]
async fn poll_before_open_fails() {
    let server = MockServer::start().await;
    let mut transport = poll_transport(&server);
    assert_eq!(transport.kind(), TransportKind::HttpPoll);
    assert!(matches!(
        transport.poll_once().await,
        Err(SyncError::Connection(_))
    ));
}

#[tokio::test]
async fn poll_returns_each_message_of_an_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"type": "WIDGET_UPDATE", "payload": {"type": "widget", "data": {"widgetId": "w1"}}, "timestamp": 1},
            {"type": "SERVER_INFO", "payload": {"message": "hello"}, "timestamp": 2},
        ])))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::channel(16);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();

    let frames = transport.poll_once().await.unwrap();
    assert_eq!(
        frame_types(&frames),
        vec![MessageType::WidgetUpdate, MessageType::ServerInfo]
    );
    // Polled frames are returned, never pushed into the event channel.
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn poll_returns_a_single_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"type": "SYNC_REQUEST", "timestamp": 1})),
        )
        .mount(&server)
        .await;

    let (tx, _rx) = mpsc::channel(16);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();

    let frames = transport.poll_once().await.unwrap();
    assert_eq!(frame_types(&frames), vec![MessageType::SyncRequest]);
}

#[tokio::test]
async fn poll_with_nothing_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let (tx, _rx) = mpsc::channel(16);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();

    assert!(transport.poll_once().await.unwrap().is_empty());
}

#[tokio::test]
async fn poll_error_status_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (tx, _rx) = mpsc::channel(16);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();

    let err = transport.poll_once().await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn send_posts_message_and_forwards_reply() {
    let server = MockServer::start().await;
    let message = WireMessage::ping(ts(0));
    Mock::given(method("POST"))
        .and(path("/poll"))
        .and(body_json(&message))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(WireMessage::pong(ts(1))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::channel(16);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();
    transport.send(&message).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_types(&[reply]), vec![MessageType::Pong]);
}

#[tokio::test]
async fn poll_larger_than_the_event_buffer() {
    let server = MockServer::start().await;
    let messages: Vec<_> = (0..300)
        .map(|i| json!({"type": "SERVER_INFO", "payload": {"n": i}, "timestamp": i}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages))
        .mount(&server)
        .await;

    // Nobody reads the channel while the poll runs.
    let (tx, _rx) = mpsc::channel(1);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();

    let frames = tokio::time::timeout(Duration::from_secs(5), transport.poll_once())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frames.len(), 300);
}

#[tokio::test]
async fn closed_poll_transport_stops_forwarding() {
    let server = MockServer::start().await;
    let (tx, _rx) = mpsc::channel(16);
    let mut transport = poll_transport(&server);
    transport.open(tx).await.unwrap();
    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert!(transport.poll_once().await.is_err());
}

// ── WebSocket ────────────────────────────────────────────────────

#[tokio::test]
async fn websocket_send_requires_connection() {
    let mut transport =
        WebSocketTransport::new("ws://127.0.0.1:9/realtime", Duration::from_millis(200));
    assert_eq!(transport.kind(), TransportKind::WebSocket);
    assert_eq!(transport.url(), "ws://127.0.0.1:9/realtime");
    assert!(matches!(
        transport.send(&WireMessage::ping(ts(0))).await,
        Err(SyncError::Connection(_))
    ));
    transport.close().await.unwrap();
    assert!(matches!(
        transport.poll_once().await,
        Err(SyncError::Connection(_))
    ));
}

// ── Mock transport ───────────────────────────────────────────────

#[tokio::test]
async fn mock_records_sends_and_delivers_frames() {
    let mock = MockTransport::new(TransportKind::WebSocket);
    let mut transport: Box<dyn Transport> = Box::new(mock.clone());
    let (tx, mut rx) = mpsc::channel(16);

    assert!(transport.send(&WireMessage::ping(ts(0))).await.is_err());
    transport.open(tx).await.unwrap();
    assert!(mock.is_open());

    transport.send(&WireMessage::ping(ts(0))).await.unwrap();
    assert_eq!(mock.sent(), vec![WireMessage::ping(ts(0))]);
    assert_eq!(mock.take_sent().len(), 1);
    assert!(mock.sent().is_empty());

    mock.deliver_message(&WireMessage::pong(ts(1))).await.unwrap();
    assert_eq!(message_types(&drain(&mut rx)), vec![MessageType::Pong]);

    mock.drop_connection("server restart").await.unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![TransportEvent::Closed {
            reason: "server restart".into()
        }]
    );
    assert!(!mock.is_open());
}

#[tokio::test]
async fn mock_refuses_scripted_dials() {
    let mock = MockTransport::new(TransportKind::WebSocket);
    let mut transport = mock.clone();
    mock.fail_next_dials(2);

    for _ in 0..2 {
        let (tx, _rx) = mpsc::channel(1);
        assert!(transport.open(tx).await.is_err());
    }
    let (tx, _rx) = mpsc::channel(1);
    transport.open(tx).await.unwrap();
    assert_eq!(mock.dial_count(), 3);

    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn mock_poll_returns_queued_frames() {
    let mock = MockTransport::new(TransportKind::HttpPoll);
    let mut transport = mock.clone();
    let (tx, mut rx) = mpsc::channel(16);
    transport.open(tx).await.unwrap();

    let frame = WireMessage::new(MessageType::ServerInfo, json!({"message": "hi"}), ts(0))
        .to_json()
        .unwrap();
    mock.queue_poll_response(vec![frame.clone(), frame]);

    assert_eq!(transport.poll_once().await.unwrap().len(), 2);
    assert!(transport.poll_once().await.unwrap().is_empty());
    assert_eq!(mock.poll_count(), 2);
    assert!(drain(&mut rx).is_empty());
}
