//! Glue between connection lifecycle, the registry and the host.

use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, warn};

use crate::callbacks::{Capability, HostCallbacks};
use crate::config::MessageLimit;
use crate::errors::{ProtocolError, SendError};
use crate::metrics::{
    WS_BROADCASTS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::websocket::connection::{CloseReason, Connection};
use crate::websocket::dispatcher::{DispatchOutcome, Dispatcher};
use crate::websocket::frame::{Frame, Inbound};
use crate::websocket::registry::{BroadcastReport, ConnectionRegistry};

/// Cheap-to-clone handle shared by the server, every session and the host.
///
/// Host handlers can hold one and broadcast from inside a callback.
#[derive(Clone)]
pub struct ServerController {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    limit: MessageLimit,
}

impl ServerController {
    /// Controller over a fresh registry.
    pub fn new(callbacks: HostCallbacks, limit: MessageLimit, max_dropped_frames: u64) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(max_dropped_frames)),
            dispatcher: Arc::new(Dispatcher::new(callbacks)),
            limit,
        }
    }

    /// Register an upgraded connection and open it for broadcasts.
    pub fn on_client_connected(&self, connection: Arc<Connection>) {
        if !connection.mark_open() {
            debug!(conn_id = %connection.id(), "connection closed before registration");
            return;
        }
        info!(conn_id = %connection.id(), "client connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        connection.set_registered();
        self.registry.add(connection);
    }

    /// Drop a connection from the registry. Only the first call per
    /// connection records the disconnect, including for connections a
    /// broadcast already evicted.
    pub fn on_client_disconnected(&self, connection: &Arc<Connection>) {
        let _ = self.registry.unregister(connection);
        if !connection.take_registered() {
            return;
        }
        let reason = connection
            .close_reason()
            .unwrap_or(CloseReason::ClientClosed);
        info!(conn_id = %connection.id(), %reason, "client disconnected");
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    }

    /// Record a protocol error on a connection. The caller closes it.
    pub fn on_client_error(&self, connection: &Connection, error: &ProtocolError) {
        warn!(conn_id = %connection.id(), error = %error, "connection protocol error");
    }

    /// Hand an inbound frame to the host.
    pub fn on_inbound(&self, connection: &Connection, inbound: &Inbound) -> DispatchOutcome {
        self.dispatcher.dispatch(connection.id(), inbound)
    }

    /// Broadcast a text message to every open connection.
    pub fn broadcast_text(&self, message: &str) -> Result<BroadcastReport, SendError> {
        self.broadcast(Frame::text(message))
    }

    /// Broadcast a binary message to every open connection.
    pub fn broadcast_binary(&self, data: impl Into<Bytes>) -> Result<BroadcastReport, SendError> {
        self.broadcast(Frame::binary(data))
    }

    /// Broadcast a frame. Fails without touching any connection when the
    /// frame exceeds the current limit.
    pub fn broadcast(&self, frame: Frame) -> Result<BroadcastReport, SendError> {
        self.limit.check(frame.len())?;
        counter!(WS_BROADCASTS_TOTAL, "kind" => frame.kind()).increment(1);
        Ok(self.registry.broadcast(&frame))
    }

    /// Registry handle.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Shared message size limit.
    pub fn limit(&self) -> &MessageLimit {
        &self.limit
    }

    /// Host capability resolved at startup.
    pub fn capability(&self) -> Capability {
        self.dispatcher.capability()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

impl std::fmt::Debug for ServerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerController")
            .field("connections", &self.registry.len())
            .field("capability", &self.dispatcher.capability())
            .field("max_message_size", &self.limit.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::websocket::connection::{ConnectionId, ConnectionState};

    fn controller(callbacks: HostCallbacks, limit: usize) -> ServerController {
        ServerController::new(callbacks, MessageLimit::new(limit), 100)
    }

    fn connection(
        ctl: &ServerController,
        id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(
            ConnectionId::from(id),
            tx,
            ctl.limit().clone(),
            CancellationToken::new(),
        ));
        (conn, rx)
    }

    #[test]
    fn connect_registers_and_opens() {
        let ctl = controller(HostCallbacks::new(), 64);
        let (conn, _rx) = connection(&ctl, "c1");
        ctl.on_client_connected(Arc::clone(&conn));
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(ctl.connection_count(), 1);
    }

    #[test]
    fn connection_closed_before_registration_is_skipped() {
        let ctl = controller(HostCallbacks::new(), 64);
        let (conn, _rx) = connection(&ctl, "c1");
        let _ = conn.close(CloseReason::ServerShutdown);
        ctl.on_client_connected(conn);
        assert_eq!(ctl.connection_count(), 0);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let ctl = controller(HostCallbacks::new(), 64);
        let (conn, _rx) = connection(&ctl, "c1");
        ctl.on_client_connected(Arc::clone(&conn));
        ctl.on_client_disconnected(&conn);
        ctl.on_client_disconnected(&conn);
        assert_eq!(ctl.connection_count(), 0);
    }

    #[test]
    fn oversize_broadcast_touches_nobody() {
        let ctl = controller(HostCallbacks::new(), 4);
        let (conn, mut rx) = connection(&ctl, "c1");
        ctl.on_client_connected(conn);
        assert_eq!(
            ctl.broadcast_text("too long"),
            Err(SendError::TooLarge { size: 8, limit: 4 })
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(ctl.broadcast_text("ok").unwrap().delivered, 1);
    }

    #[test]
    fn limit_change_applies_to_next_broadcast() {
        let ctl = controller(HostCallbacks::new(), 4);
        assert!(ctl.broadcast_binary(vec![0u8; 8]).is_err());
        ctl.limit().set(8);
        assert!(ctl.broadcast_binary(vec![0u8; 8]).is_ok());
    }

    #[test]
    fn duplicate_disconnect_is_counted_once() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            let ctl = controller(HostCallbacks::new(), 64);
            let (conn, _rx) = connection(&ctl, "c1");
            ctl.on_client_connected(Arc::clone(&conn));
            ctl.on_client_disconnected(&conn);
            ctl.on_client_disconnected(&conn);
        });
        let rendered = handle.render();
        assert!(rendered.contains("ws_connections_active 0"), "{rendered}");
        assert!(
            rendered.contains(r#"ws_disconnections_total{reason="client_closed"} 1"#),
            "{rendered}"
        );
    }

    #[test]
    fn evicted_slow_client_is_accounted_on_disconnect() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            let ctl = ServerController::new(HostCallbacks::new(), MessageLimit::new(64), 1);
            let (tx, _rx) = mpsc::channel(1);
            let conn = Arc::new(Connection::new(
                ConnectionId::from("slow"),
                tx,
                ctl.limit().clone(),
                CancellationToken::new(),
            ));
            ctl.on_client_connected(Arc::clone(&conn));

            assert_eq!(ctl.broadcast_text("fill").unwrap().delivered, 1);
            let report = ctl.broadcast_text("overflow").unwrap();
            assert_eq!(report.failures[0].error, SendError::QueueFull);
            assert_eq!(ctl.connection_count(), 0);
            assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));

            // The session notices the eviction and exits.
            ctl.on_client_disconnected(&conn);
        });
        let rendered = handle.render();
        assert!(rendered.contains("ws_connections_active 0"), "{rendered}");
        assert!(
            rendered.contains(r#"ws_disconnections_total{reason="slow_consumer"} 1"#),
            "{rendered}"
        );
        assert!(rendered.contains("ws_connection_duration_seconds"), "{rendered}");
    }

    #[tokio::test]
    async fn handler_can_broadcast_reentrantly() {
        static CONTROLLER: OnceLock<ServerController> = OnceLock::new();
        let callbacks = HostCallbacks::new().with_text(|message: &str| {
            if let Some(ctl) = CONTROLLER.get() {
                let _ = ctl.broadcast_binary(message.as_bytes().to_vec());
            }
        });
        let ctl = CONTROLLER.get_or_init(|| controller(callbacks, 64));
        let (c1, mut rx1) = connection(ctl, "c1");
        let (c2, mut rx2) = connection(ctl, "c2");
        ctl.on_client_connected(Arc::clone(&c1));
        ctl.on_client_connected(c2);

        let inbound = Inbound::Text("echo".to_owned().into());
        assert_eq!(ctl.on_inbound(&c1, &inbound), DispatchOutcome::Delivered);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                Frame::Binary(data) => assert_eq!(&data[..], b"echo"),
                Frame::Text(_) => panic!("expected binary"),
            }
        }
    }
}
