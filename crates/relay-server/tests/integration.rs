//! End-to-end integration tests using real WebSocket clients.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use relay_server::{
    ConnectionState, HostCallbacks, OversizePolicy, RelayServer, ServerConfig, ServerController,
    ShutdownOutcome,
};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// What the host saw, in arrival order.
#[derive(Debug, PartialEq, Eq)]
enum HostEvent {
    Text(String),
    Binary(Vec<u8>, usize, usize),
}

fn local_config(path: &str) -> ServerConfig {
    ServerConfig::new(0, path)
        .with_host("127.0.0.1")
        .with_shutdown_grace(Duration::from_secs(1))
}

/// Callbacks that forward every inbound message to a channel.
fn recording_callbacks() -> (HostCallbacks, mpsc::UnboundedReceiver<HostEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let text_tx = tx.clone();
    let callbacks = HostCallbacks::new()
        .with_text(move |m: &str| {
            let _ = text_tx.send(HostEvent::Text(m.to_owned()));
        })
        .with_binary(move |data: &[u8], offset: usize, length: usize| {
            let _ = tx.send(HostEvent::Binary(data.to_vec(), offset, length));
        });
    (callbacks, rx)
}

fn ws_url(server: &RelayServer, path: &str) -> String {
    format!("ws://{}{path}", server.local_addr())
}

async fn connect(url: &str) -> WsStream {
    let (ws, _resp) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Wait until the registry holds exactly `n` connections.
async fn wait_for_connections(server: &RelayServer, n: usize) {
    timeout(TIMEOUT, async {
        while server.connection_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {n} connections, have {}", server.connection_count()));
}

/// Next text or binary message, skipping control frames.
async fn next_data(ws: &mut WsStream) -> Message {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("read timed out")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Ping(_) | Message::Pong(_) => {}
            other => return other,
        }
    }
}

/// Read until the server closes; returns the close code if a close frame arrived.
async fn expect_close(ws: &mut WsStream) -> Option<u16> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("close timed out") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

async fn next_host_event(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> HostEvent {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("host event timed out")
        .expect("host channel closed")
}

fn text_of(msg: Message) -> String {
    match msg {
        Message::Text(text) => text.as_str().to_owned(),
        other => panic!("expected text, got {other:?}"),
    }
}

#[tokio::test]
async fn text_message_reaches_host() {
    let (callbacks, mut events) = recording_callbacks();
    let server = RelayServer::start(local_config("/john"), callbacks)
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/john")).await;

    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(
        next_host_event(&mut events).await,
        HostEvent::Text("hello".into())
    );
    let _ = server.dispose().await;
}

#[tokio::test]
async fn binary_message_reaches_host_with_window() {
    let (callbacks, mut events) = recording_callbacks();
    let server = RelayServer::start(local_config("/"), callbacks)
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/")).await;

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    assert_eq!(
        next_host_event(&mut events).await,
        HostEvent::Binary(vec![1, 2, 3], 0, 3)
    );
    let _ = server.dispose().await;
}

#[tokio::test]
async fn messages_from_one_client_arrive_in_order() {
    let (callbacks, mut events) = recording_callbacks();
    let server = RelayServer::start(local_config("/ws"), callbacks)
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;

    for i in 0..50 {
        ws.send(Message::Text(format!("m{i}").into())).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(
            next_host_event(&mut events).await,
            HostEvent::Text(format!("m{i}"))
        );
    }
    let _ = server.dispose().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let server = RelayServer::start(local_config("/ws"), HostCallbacks::new())
        .await
        .unwrap();
    let url = ws_url(&server, "/ws");
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect(&url).await);
    }
    wait_for_connections(&server, 5).await;

    let report = server.send_text("to everyone").unwrap();
    assert_eq!(report.recipients, 5);
    assert_eq!(report.delivered, 5);
    assert!(report.is_complete());
    for ws in &mut clients {
        assert_eq!(text_of(next_data(ws).await), "to everyone");
    }

    let report = server.send_binary(vec![7u8; 3]).unwrap();
    assert_eq!(report.delivered, 5);
    for ws in &mut clients {
        match next_data(ws).await {
            Message::Binary(data) => assert_eq!(&data[..], &[7, 7, 7]),
            other => panic!("expected binary, got {other:?}"),
        }
    }
    let _ = server.dispose().await;
}

#[tokio::test]
async fn broadcast_preserves_order_per_client() {
    let server = RelayServer::start(local_config("/ws"), HostCallbacks::new())
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;

    for i in 0..20 {
        let _ = server.send_text(&format!("n{i}")).unwrap();
    }
    for i in 0..20 {
        assert_eq!(text_of(next_data(&mut ws).await), format!("n{i}"));
    }
    let _ = server.dispose().await;
}

#[tokio::test]
async fn trailing_slash_is_same_endpoint() {
    let server = RelayServer::start(local_config("/john"), HostCallbacks::new())
        .await
        .unwrap();
    let _a = connect(&ws_url(&server, "/john")).await;
    let _b = connect(&ws_url(&server, "/john/")).await;
    wait_for_connections(&server, 2).await;

    match connect_async(ws_url(&server, "/jane")).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 404),
        Err(e) => panic!("expected 404, got {e}"),
        Ok(_) => panic!("expected 404, upgrade succeeded"),
    }
    let _ = server.dispose().await;
}

#[tokio::test]
async fn oversize_inbound_dropped_connection_stays_open() {
    let (callbacks, mut events) = recording_callbacks();
    let config = local_config("/ws").with_max_message_size(10);
    let server = RelayServer::start(config, callbacks).await.unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;

    ws.send(Message::Text("a".repeat(11).into())).await.unwrap();
    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(
        next_host_event(&mut events).await,
        HostEvent::Text("hello".into())
    );

    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.send_text("still here").unwrap().delivered, 1);
    assert_eq!(text_of(next_data(&mut ws).await), "still here");
    let _ = server.dispose().await;
}

#[tokio::test]
async fn oversize_close_policy_closes_with_1009() {
    let (callbacks, _events) = recording_callbacks();
    let config = local_config("/ws")
        .with_max_message_size(10)
        .with_oversize_policy(OversizePolicy::Close);
    let server = RelayServer::start(config, callbacks).await.unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;

    ws.send(Message::Binary(vec![0u8; 11].into())).await.unwrap();
    assert_eq!(expect_close(&mut ws).await, Some(1009));
    wait_for_connections(&server, 0).await;
    let _ = server.dispose().await;
}

#[tokio::test]
async fn limit_change_applies_to_live_connections() {
    let (callbacks, mut events) = recording_callbacks();
    let server = RelayServer::start(local_config("/ws"), callbacks)
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;

    server.set_max_message_size(4);
    ws.send(Message::Text("hello".into())).await.unwrap();
    ws.send(Message::Text("hey".into())).await.unwrap();
    assert_eq!(
        next_host_event(&mut events).await,
        HostEvent::Text("hey".into())
    );
    assert!(server.send_text("hello").is_err());
    let _ = server.dispose().await;
}

#[tokio::test]
async fn callback_can_broadcast_without_deadlock() {
    let controller: Arc<OnceLock<ServerController>> = Arc::new(OnceLock::new());
    let handle = Arc::clone(&controller);
    let callbacks = HostCallbacks::new().with_text(move |m: &str| {
        if let Some(ctl) = handle.get() {
            let _ = ctl.broadcast_binary(m.as_bytes().to_vec());
        }
    });
    let server = RelayServer::start(local_config("/ws"), callbacks)
        .await
        .unwrap();
    let _ = controller.set(server.controller().clone());

    let url = ws_url(&server, "/ws");
    let mut sender = connect(&url).await;
    let mut listener = connect(&url).await;
    wait_for_connections(&server, 2).await;

    sender.send(Message::Text("ping all".into())).await.unwrap();
    for ws in [&mut sender, &mut listener] {
        match next_data(ws).await {
            Message::Binary(data) => assert_eq!(&data[..], b"ping all"),
            other => panic!("expected binary, got {other:?}"),
        }
    }
    let _ = server.dispose().await;
}

#[tokio::test]
async fn panicking_callback_keeps_connection_alive() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = HostCallbacks::new().with_text(move |m: &str| {
        assert_ne!(m, "boom", "host rejected message");
        let _ = tx.send(m.to_owned());
    });
    let server = RelayServer::start(local_config("/ws"), callbacks)
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;

    ws.send(Message::Text("boom".into())).await.unwrap();
    ws.send(Message::Text("fine".into())).await.unwrap();
    let got = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, "fine");
    assert_eq!(server.connection_count(), 1);
    let _ = server.dispose().await;
}

#[tokio::test]
async fn client_disconnect_removes_connection() {
    let server = RelayServer::start(local_config("/ws"), HostCallbacks::new())
        .await
        .unwrap();
    let url = ws_url(&server, "/ws");
    let mut leaving = connect(&url).await;
    let mut staying = connect(&url).await;
    wait_for_connections(&server, 2).await;

    leaving.close(None).await.unwrap();
    wait_for_connections(&server, 1).await;

    let report = server.send_text("after leave").unwrap();
    assert_eq!(report.recipients, 1);
    assert_eq!(text_of(next_data(&mut staying).await), "after leave");
    let _ = server.dispose().await;
}

#[tokio::test]
async fn capacity_exceeded_is_refused() {
    let config = local_config("/ws").with_max_connections(1);
    let server = RelayServer::start(config, HostCallbacks::new())
        .await
        .unwrap();
    let url = ws_url(&server, "/ws");
    let _first = connect(&url).await;
    wait_for_connections(&server, 1).await;

    match connect_async(url.as_str()).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 503),
        Err(e) => panic!("expected 503, got {e}"),
        Ok(_) => panic!("expected 503, upgrade succeeded"),
    }
    assert_eq!(server.connection_count(), 1);
    let _ = server.dispose().await;
}

#[tokio::test]
async fn concurrent_dispose_closes_every_connection_once() {
    let server = RelayServer::start(local_config("/ws"), HostCallbacks::new())
        .await
        .unwrap();
    let url = ws_url(&server, "/ws");
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(&url).await);
    }
    wait_for_connections(&server, 3).await;
    let live = server.controller().registry().snapshot();
    assert_eq!(live.len(), 3);

    let (first, second) = tokio::join!(server.dispose(), server.dispose());
    assert_eq!(first, ShutdownOutcome::Graceful);
    assert_eq!(first, second);
    assert_eq!(server.connection_count(), 0);
    for conn in &live {
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    for ws in &mut clients {
        assert_eq!(expect_close(ws).await, Some(1001));
    }
    assert!(connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn queued_messages_flushed_before_dispose_close() {
    let server = RelayServer::start(local_config("/ws"), HostCallbacks::new())
        .await
        .unwrap();
    let mut ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;

    let _ = server.send_text("last words").unwrap();
    let _ = server.dispose().await;

    assert_eq!(text_of(next_data(&mut ws).await), "last words");
    assert_eq!(expect_close(&mut ws).await, Some(1001));
}

#[tokio::test]
async fn send_after_dispose_reaches_nobody() {
    let server = RelayServer::start(local_config("/ws"), HostCallbacks::new())
        .await
        .unwrap();
    let _ws = connect(&ws_url(&server, "/ws")).await;
    wait_for_connections(&server, 1).await;
    let _ = server.dispose().await;

    let report = server.send_text("anyone?").unwrap();
    assert_eq!(report.recipients, 0);
}
