//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may be partial: missing fields take their compiled default.

use serde::{Deserialize, Serialize};

/// Default maximum inbound/outbound message size in bytes (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_536;

/// Root settings type for the relay server.
///
/// ```json
/// {
///   "server": { "port": 8025, "path": "/john", "maxMessageSize": 1024 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener and connection settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// What to do with an inbound frame larger than the configured maximum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Drop the frame and keep the connection open.
    #[default]
    Drop,
    /// Close the connection with status 1009 (message too big).
    Close,
}

/// Server network and runtime settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port (`0` picks an ephemeral port).
    pub port: u16,
    /// Mount path clients connect to. `/ws` and `/ws/` are equivalent.
    pub path: String,
    /// Maximum text or binary message size in bytes.
    pub max_message_size: usize,
    /// Hard frame ceiling enforced by the WebSocket transport itself.
    ///
    /// Kept above `max_message_size` so that oversize frames reach the
    /// application policy instead of killing the connection in the codec.
    pub transport_max_frame_size: usize,
    /// Handling of inbound frames above `max_message_size`.
    pub oversize_policy: OversizePolicy,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    /// Dropped outbound frames tolerated before a slow client is disconnected.
    pub max_dropped_frames: u64,
    /// Upper bound on a single socket write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Server ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a connection after this long without a pong or any frame.
    pub heartbeat_timeout_ms: u64,
    /// Grace period for connections to close during shutdown.
    pub shutdown_grace_ms: u64,
    /// Health endpoint path; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8025,
            path: "/".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            transport_max_frame_size: 16 * 1024 * 1024,
            oversize_policy: OversizePolicy::Drop,
            max_connections: 1024,
            send_queue_capacity: 256,
            max_dropped_frames: 100,
            write_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            shutdown_grace_ms: 5_000,
            health_path: Some("/health".to_string()),
        }
    }
}

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level written to stderr (`RUST_LOG` still wins when set).
    pub level: LogLevel,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}
