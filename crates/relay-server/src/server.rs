//! `RelayServer`: the listener, its routes and the server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use bytes::Bytes;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::callbacks::HostCallbacks;
use crate::config::{MessageLimit, MountPath, ServerConfig};
use crate::controller::ServerController;
use crate::errors::{ConnectError, SendError, StartupError};
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::websocket::connection::{CloseReason, ConnectionId};
use crate::websocket::registry::BroadcastReport;
use crate::websocket::session::run_session;

/// Path of the Prometheus endpoint when a metrics handle is supplied.
pub const METRICS_PATH: &str = "/metrics";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Controller shared with every session.
    pub controller: ServerController,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, if metrics are exported.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    fn admit(&self) -> Result<(), ConnectError> {
        if self.shutdown.is_shutting_down() {
            return Err(ConnectError::ShuttingDown);
        }
        let limit = self.config.max_connections;
        if self.controller.connection_count() >= limit {
            return Err(ConnectError::CapacityExceeded { limit });
        }
        Ok(())
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, mount: &MountPath, health: Option<&MountPath>) -> Router {
    let mut router = Router::new();
    for route in mount.routes() {
        router = router.route(&route, get(ws_handler));
    }
    if let Some(health) = health {
        router = router.route(health.as_str(), get(health_handler));
    }
    if state.metrics.is_some() {
        router = router.route(METRICS_PATH, get(metrics_handler));
    }
    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Configures and starts a [`RelayServer`].
#[must_use]
pub struct RelayServerBuilder {
    config: ServerConfig,
    callbacks: HostCallbacks,
    metrics: Option<PrometheusHandle>,
}

impl RelayServerBuilder {
    /// Host handlers for inbound messages.
    pub fn callbacks(mut self, callbacks: HostCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Serve `GET /metrics` from this Prometheus handle.
    pub fn metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Validate the configuration, bind the listener and start serving.
    pub async fn start(self) -> Result<RelayServer, StartupError> {
        let Self {
            config,
            callbacks,
            metrics,
        } = self;
        config.validate()?;

        let mount = MountPath::parse(&config.path)?;
        let health = config
            .health_path
            .as_deref()
            .map(MountPath::parse)
            .transpose()?;
        if let Some(health) = &health {
            if health.as_str() == mount.as_str() {
                return Err(StartupError::RouteConflict(health.to_string()));
            }
        }
        if metrics.is_some()
            && (mount.as_str() == METRICS_PATH
                || health.as_ref().is_some_and(|h| h.as_str() == METRICS_PATH))
        {
            return Err(StartupError::RouteConflict(METRICS_PATH.to_owned()));
        }

        let limit = MessageLimit::new(config.max_message_size);
        let controller = ServerController::new(callbacks, limit, config.max_dropped_frames);
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let config = Arc::new(config);
        let state = AppState {
            controller: controller.clone(),
            config: Arc::clone(&config),
            shutdown: Arc::clone(&shutdown),
            start_time: Instant::now(),
            metrics,
        };
        let router = build_router(state.clone(), &mount, health.as_ref());

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;

        info!(
            %local_addr,
            path = %mount,
            capability = ?controller.capability(),
            max_message_size = config.max_message_size,
            "relay server listening"
        );

        let token = shutdown.token();
        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });

        Ok(RelayServer {
            state,
            mount,
            health,
            local_addr,
            serve: Mutex::new(Some(serve)),
            disposed: OnceCell::new(),
        })
    }
}

/// A running broadcast WebSocket server.
///
/// Dropping an undisposed server cancels all of its tasks without waiting.
pub struct RelayServer {
    state: AppState,
    mount: MountPath,
    health: Option<MountPath>,
    local_addr: SocketAddr,
    serve: Mutex<Option<JoinHandle<()>>>,
    disposed: OnceCell<ShutdownOutcome>,
}

impl RelayServer {
    /// Builder for a server with metrics or other extras.
    pub fn builder(config: ServerConfig) -> RelayServerBuilder {
        RelayServerBuilder {
            config,
            callbacks: HostCallbacks::default(),
            metrics: None,
        }
    }

    /// Bind and start serving with the given host handlers.
    pub async fn start(
        config: ServerConfig,
        callbacks: HostCallbacks,
    ) -> Result<Self, StartupError> {
        Self::builder(config).callbacks(callbacks).start().await
    }

    /// Broadcast a text message to every live connection.
    pub fn send_text(&self, message: &str) -> Result<BroadcastReport, SendError> {
        self.state.controller.broadcast_text(message)
    }

    /// Broadcast a binary message to every live connection.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<BroadcastReport, SendError> {
        self.state.controller.broadcast_binary(data)
    }

    /// Change the message size limit for subsequent frames on every connection.
    ///
    /// The transport frame ceiling is fixed when a connection is accepted, at
    /// the larger of `transport_max_frame_size` and the limit at that moment.
    /// Raising the limit above that ceiling only takes full effect for
    /// connections accepted afterwards: existing sockets still fail at the
    /// transport for frames above their ceiling, whatever the oversize policy.
    pub fn set_max_message_size(&self, bytes: usize) {
        info!(max_message_size = bytes, "message size limit changed");
        self.state.controller.limit().set(bytes);
    }

    /// Current message size limit.
    pub fn max_message_size(&self) -> usize {
        self.state.controller.limit().get()
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Normalized WebSocket mount path.
    pub fn mount_path(&self) -> &MountPath {
        &self.mount
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.state.controller.connection_count()
    }

    /// Controller handle for host code (e.g. broadcasting from a callback).
    pub fn controller(&self) -> &ServerController {
        &self.state.controller
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Whether dispose has started.
    pub fn is_shutting_down(&self) -> bool {
        self.state.shutdown.is_shutting_down()
    }

    /// A fresh router over this server's state, for in-process requests.
    pub fn router(&self) -> Router {
        build_router(self.state.clone(), &self.mount, self.health.as_ref())
    }

    /// Stop accepting, close every connection and release the listener.
    ///
    /// Runs once; concurrent and later callers wait for the same teardown and
    /// get its outcome.
    pub async fn dispose(&self) -> ShutdownOutcome {
        *self.disposed.get_or_init(|| self.teardown()).await
    }

    async fn teardown(&self) -> ShutdownOutcome {
        let grace = self.state.config.shutdown_grace;
        info!(
            connections = self.connection_count(),
            grace_ms = grace.as_millis(),
            "disposing relay server"
        );

        let closing = self
            .state
            .controller
            .registry()
            .close_all(&CloseReason::ServerShutdown);
        let outcome = self.state.shutdown.graceful_shutdown(grace).await;

        let serve = self.serve.lock().take();
        if let Some(mut handle) = serve {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("listener did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        info!(closed = closing, ?outcome, "relay server disposed");
        outcome
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if self.disposed.initialized() {
            return;
        }
        self.state.shutdown.force_shutdown();
        if let Some(handle) = self.serve.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.local_addr)
            .field("mount", &self.mount)
            .field("controller", &self.state.controller)
            .finish_non_exhaustive()
    }
}

/// GET on the mount path: upgrade to a WebSocket session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if let Err(error) = state.admit() {
        let reason = match error {
            ConnectError::CapacityExceeded { .. } => "capacity",
            ConnectError::ShuttingDown => "shutting_down",
            ConnectError::Upgrade(_) => "upgrade",
        };
        counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
        warn!(%error, "refusing websocket upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, error.to_string()).into_response();
    }

    // The transport ceiling stays above the application limit so oversize
    // frames reach the configured policy instead of failing the socket.
    let ceiling = state
        .config
        .transport_max_frame_size
        .max(state.controller.limit().get());
    let id = ConnectionId::new();
    let cancel = state.shutdown.child_token();
    let AppState {
        controller,
        config,
        shutdown,
        ..
    } = state;

    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_failed_upgrade(|e: axum::Error| {
            let error = ConnectError::Upgrade(e.to_string());
            counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => "upgrade").increment(1);
            warn!(%error, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| shutdown.track(run_session(socket, id, controller, config, cancel)))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.controller.connection_count(),
        state.controller.limit().get(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(crate::metrics::render)
        .unwrap_or_default()
}
