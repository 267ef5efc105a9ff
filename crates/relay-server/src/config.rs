//! Server configuration, mount path normalization and the shared size limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relay_settings::{OversizePolicy, ServerSettings};

use crate::errors::{SendError, StartupError};

/// Runtime configuration for a [`RelayServer`](crate::server::RelayServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// WebSocket mount path.
    pub path: String,
    /// Initial application-level message size limit in bytes.
    pub max_message_size: usize,
    /// Transport frame ceiling handed to the WebSocket codec.
    pub transport_max_frame_size: usize,
    /// What to do with an inbound frame over the limit.
    pub oversize_policy: OversizePolicy,
    /// Maximum concurrently registered connections.
    pub max_connections: usize,
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    /// Queue-full drops after which a connection is evicted as a slow consumer.
    pub max_dropped_frames: u64,
    /// Deadline for a single socket write.
    pub write_timeout: Duration,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is considered dead.
    pub heartbeat_timeout: Duration,
    /// How long dispose waits for sessions before aborting them.
    pub shutdown_grace: Duration,
    /// Path of the JSON health endpoint, if enabled.
    pub health_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    /// Build a config for `port` and `path`, everything else defaulted.
    pub fn new(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
            ..Self::default()
        }
    }

    /// Convert loaded settings into a runtime config.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            path: settings.path.clone(),
            max_message_size: settings.max_message_size,
            transport_max_frame_size: settings.transport_max_frame_size,
            oversize_policy: settings.oversize_policy,
            max_connections: settings.max_connections,
            send_queue_capacity: settings.send_queue_capacity,
            max_dropped_frames: settings.max_dropped_frames,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
            health_path: settings.health_path.clone(),
        }
    }

    /// Set the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the initial message size limit.
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the oversize policy.
    #[must_use]
    pub fn with_oversize_policy(mut self, policy: OversizePolicy) -> Self {
        self.oversize_policy = policy;
        self
    }

    /// Set the connection cap.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enable or disable the health endpoint.
    #[must_use]
    pub fn with_health_path(mut self, path: Option<String>) -> Self {
        self.health_path = path;
        self
    }

    /// Set the dispose grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set heartbeat interval and timeout.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.max_message_size == 0 {
            return Err(StartupError::Config("max_message_size must be positive".into()));
        }
        if self.send_queue_capacity == 0 {
            return Err(StartupError::Config(
                "send_queue_capacity must be positive".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(StartupError::Config("max_connections must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(StartupError::Config(
                "heartbeat_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A validated WebSocket mount path.
///
/// Stored without a trailing slash (except the root). The router serves both
/// `/p` and `/p/` for a non-root mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPath(String);

impl MountPath {
    /// Validate and normalize a raw path.
    pub fn parse(raw: &str) -> Result<Self, StartupError> {
        let invalid = |reason| StartupError::InvalidPath {
            path: raw.to_owned(),
            reason,
        };
        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        if raw.contains(['?', '#']) {
            return Err(invalid("must not contain a query or fragment"));
        }
        if raw.contains(['{', '}', '*']) || raw.contains("/:") {
            return Err(invalid("must not contain route parameters"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("must not contain whitespace"));
        }
        let trimmed = raw.trim_end_matches('/');
        if trimmed.contains("//") {
            return Err(invalid("must not contain empty segments"));
        }
        if trimmed.is_empty() {
            return Ok(Self("/".to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Normalized path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root mount.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Router paths that serve the WebSocket endpoint.
    pub fn routes(&self) -> Vec<String> {
        if self.is_root() {
            vec![self.0.clone()]
        } else {
            vec![self.0.clone(), format!("{}/", self.0)]
        }
    }
}

impl std::fmt::Display for MountPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide (per server) maximum message size.
///
/// Shared between the controller and every session; updates are visible to
/// all connections for subsequent frames.
#[derive(Clone, Debug)]
pub struct MessageLimit(Arc<AtomicUsize>);

impl MessageLimit {
    /// New limit starting at `bytes`.
    pub fn new(bytes: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(bytes)))
    }

    /// Current limit.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Replace the limit.
    pub fn set(&self, bytes: usize) {
        self.0.store(bytes, Ordering::Release);
    }

    /// Check a payload size against the current limit.
    pub fn check(&self, size: usize) -> Result<(), SendError> {
        let limit = self.get();
        if size > limit {
            Err(SendError::TooLarge { size, limit })
        } else {
            Ok(())
        }
    }
}
