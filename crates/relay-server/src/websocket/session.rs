//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use relay_settings::OversizePolicy;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, instrument, warn};

use super::connection::{CloseReason, Connection, ConnectionId};
use super::frame::{Frame, Inbound};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::controller::ServerController;
use crate::errors::ProtocolError;
use crate::metrics::{WS_FRAMES_OVERSIZE_TOTAL, WS_FRAMES_RECEIVED_TOTAL};

type WsSink = SplitSink<WebSocket, Message>;

/// Reader-side decision for one inbound message.
enum Flow {
    Continue,
    Stop,
}

/// Run a WebSocket session for an upgraded client.
///
/// 1. Registers the connection with the controller
/// 2. Spawns the writer (outbound queue, pings) and the heartbeat monitor
/// 3. Reads inbound frames and dispatches them to the host in order
/// 4. On close from either side, unregisters and releases the socket
#[instrument(skip_all, fields(conn_id = %id))]
pub async fn run_session(
    ws: WebSocket,
    id: ConnectionId,
    controller: ServerController,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Frame>(config.send_queue_capacity);
    let connection = Arc::new(Connection::new(
        id,
        send_tx,
        controller.limit().clone(),
        cancel.clone(),
    ));

    controller.on_client_connected(Arc::clone(&connection));

    let writer = AbortOnDropHandle::new(tokio::spawn(run_writer(
        ws_tx,
        send_rx,
        Arc::clone(&connection),
        config.write_timeout,
        config.heartbeat_interval,
    )));

    let heartbeat_conn = Arc::clone(&connection);
    let heartbeat_cancel = cancel.clone();
    let interval = config.heartbeat_interval;
    let timeout = config.heartbeat_timeout;
    let _heartbeat = AbortOnDropHandle::new(tokio::spawn(async move {
        if run_heartbeat(Arc::clone(&heartbeat_conn), interval, timeout, heartbeat_cancel).await
            == HeartbeatResult::TimedOut
        {
            warn!(
                conn_id = %heartbeat_conn.id(),
                ?timeout,
                idle = ?heartbeat_conn.last_seen_elapsed(),
                "client unresponsive, disconnecting"
            );
            let _ = heartbeat_conn.close(CloseReason::HeartbeatTimeout);
        }
    }));

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = ws_rx.next() => {
                let flow = match next {
                    Some(Ok(msg)) => handle_message(msg, &connection, &controller, config.oversize_policy),
                    Some(Err(e)) => {
                        let error = ProtocolError::Transport(e.to_string());
                        controller.on_client_error(&connection, &error);
                        let _ = connection.close(CloseReason::TransportError(error.to_string()));
                        Flow::Stop
                    }
                    None => {
                        let _ = connection.close(CloseReason::ClientClosed);
                        Flow::Stop
                    }
                };
                if matches!(flow, Flow::Stop) {
                    break;
                }
            }
        }
    }

    // Stop accepting frames before the writer flushes what is queued.
    let _ = connection.close(CloseReason::ServerShutdown);
    controller.on_client_disconnected(&connection);

    // The writer observes the cancelled token, flushes and sends a close frame.
    let drain = config.write_timeout.saturating_mul(2);
    if tokio::time::timeout(drain, writer).await.is_err() {
        debug!("writer did not finish in time, aborting");
    }
    if connection.mark_closed() {
        debug!(reason = ?connection.close_reason(), "connection released");
    }
}

fn handle_message(
    msg: Message,
    connection: &Connection,
    controller: &ServerController,
    policy: OversizePolicy,
) -> Flow {
    connection.mark_alive();
    let inbound = match msg {
        Message::Text(text) => Inbound::Text(text),
        Message::Binary(data) => Inbound::binary(data),
        // Pings are answered by the transport.
        Message::Ping(_) | Message::Pong(_) => return Flow::Continue,
        Message::Close(frame) => {
            info!(code = frame.as_ref().map(|f| f.code), "client sent close frame");
            let _ = connection.close(CloseReason::ClientClosed);
            return Flow::Stop;
        }
    };

    counter!(WS_FRAMES_RECEIVED_TOTAL, "kind" => inbound.kind()).increment(1);
    let limit = controller.limit().get();
    if inbound.len() > limit {
        return handle_oversize(connection, controller, &inbound, limit, policy);
    }

    let _ = controller.on_inbound(connection, &inbound);
    Flow::Continue
}

fn handle_oversize(
    connection: &Connection,
    controller: &ServerController,
    inbound: &Inbound,
    limit: usize,
    policy: OversizePolicy,
) -> Flow {
    let size = inbound.len();
    match policy {
        OversizePolicy::Drop => {
            counter!(WS_FRAMES_OVERSIZE_TOTAL, "kind" => inbound.kind(), "policy" => "drop")
                .increment(1);
            warn!(kind = inbound.kind(), size, limit, "inbound frame exceeds limit, dropped");
            Flow::Continue
        }
        OversizePolicy::Close => {
            counter!(WS_FRAMES_OVERSIZE_TOTAL, "kind" => inbound.kind(), "policy" => "close")
                .increment(1);
            let error = ProtocolError::FrameTooLarge { size, limit };
            controller.on_client_error(connection, &error);
            let _ = connection.close(CloseReason::MessageTooLarge);
            Flow::Stop
        }
    }
}

/// Forward queued frames to the socket, sending periodic pings.
///
/// Every write is bounded by `write_timeout`; a stalled peer closes the
/// connection instead of blocking the task forever.
async fn run_writer(
    mut ws_tx: WsSink,
    mut send_rx: mpsc::Receiver<Frame>,
    connection: Arc<Connection>,
    write_timeout: Duration,
    ping_interval: Duration,
) {
    let cancel = connection.cancel_token().clone();
    let mut ping = tokio::time::interval(ping_interval);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = send_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(reason) = write(&mut ws_tx, frame.into(), write_timeout).await {
                    let _ = connection.close(reason);
                    return;
                }
            }
            _ = ping.tick() => {
                if let Err(reason) = write(&mut ws_tx, Message::Ping(bytes::Bytes::new()), write_timeout).await {
                    let _ = connection.close(reason);
                    return;
                }
            }
        }
    }

    // Flush frames queued before the close started.
    send_rx.close();
    while let Some(frame) = send_rx.recv().await {
        if write(&mut ws_tx, frame.into(), write_timeout).await.is_err() {
            return;
        }
    }

    let reason = connection
        .close_reason()
        .unwrap_or(CloseReason::ServerShutdown);
    if !matches!(reason, CloseReason::ClientClosed | CloseReason::TransportError(_)) {
        let close = Message::Close(Some(CloseFrame {
            code: reason.close_code(),
            reason: Utf8Bytes::from_static(reason.as_str()),
        }));
        let _ = write(&mut ws_tx, close, write_timeout).await;
    }
    let _ = tokio::time::timeout(write_timeout, ws_tx.close()).await;
}

async fn write(ws_tx: &mut WsSink, msg: Message, timeout: Duration) -> Result<(), CloseReason> {
    match tokio::time::timeout(timeout, ws_tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "socket write failed");
            Err(CloseReason::TransportError(e.to_string()))
        }
        Err(_) => {
            warn!(?timeout, "socket write timed out");
            Err(CloseReason::WriteTimeout)
        }
    }
}
