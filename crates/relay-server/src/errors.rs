//! Error taxonomy for the relay server.
//!
//! Only [`StartupError`] is fatal. Every other error is scoped to a single
//! connection or a single delivery and is isolated from the rest.

use thiserror::Error;

/// The listener could not be brought up. Surfaced from `RelayServer::start`.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The configured mount path is unusable.
    #[error("invalid mount path {path:?}: {reason}")]
    InvalidPath {
        /// The rejected path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// An auxiliary route (health, metrics) collides with the mount path.
    #[error("route {0:?} conflicts with the WebSocket mount path")]
    RouteConflict(String),
    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Binding the TCP listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// An upgrade request was refused; the connection never enters the registry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The server already holds `max_connections` live connections.
    #[error("connection limit of {limit} reached")]
    CapacityExceeded {
        /// Configured limit.
        limit: usize,
    },
    /// The server is being disposed.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The HTTP upgrade itself failed.
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),
}

/// A frame could not be queued for one connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The target connection is closing or closed.
    #[error("connection closed")]
    Closed,
    /// The frame exceeds the configured maximum message size.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Frame payload size.
        size: usize,
        /// Limit in force when the frame was checked.
        limit: usize,
    },
    /// The connection's outbound queue is full (slow consumer).
    #[error("outbound queue full")]
    QueueFull,
}

impl SendError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::TooLarge { .. } => "too_large",
            Self::QueueFull => "queue_full",
        }
    }
}

/// The peer or the transport violated the protocol; the connection is closed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The transport reported a read error (malformed frame, reset, ...).
    #[error("transport error: {0}")]
    Transport(String),
    /// An inbound frame exceeded the limit under the `close` policy.
    #[error("inbound frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Frame payload size.
        size: usize,
        /// Limit in force when the frame arrived.
        limit: usize,
    },
}
