//! # relay-server
//!
//! Broadcast WebSocket server built on axum.
//!
//! - One mount path (`/p` and `/p/` are the same endpoint)
//! - Inbound text and binary frames are handed to host callbacks
//! - `send_text` / `send_binary` fan a message out to every live connection
//! - A per-server message size limit, adjustable at runtime
//! - Health and Prometheus endpoints, heartbeat, bounded graceful shutdown
//!
//! ```no_run
//! use relay_server::{HostCallbacks, RelayServer, ServerConfig};
//!
//! # async fn run() -> Result<(), relay_server::StartupError> {
//! let callbacks = HostCallbacks::new().with_text(|msg: &str| println!("got {msg}"));
//! let server = RelayServer::start(ServerConfig::new(8025, "/john"), callbacks).await?;
//! let _ = server.send_text("hello everyone");
//! let _ = server.dispose().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod callbacks;
pub mod config;
pub mod controller;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use callbacks::{BinaryHandler, Capability, HostCallbacks, TextHandler};
pub use config::{MessageLimit, MountPath, ServerConfig};
pub use controller::ServerController;
pub use errors::{ConnectError, ProtocolError, SendError, StartupError};
pub use relay_settings::OversizePolicy;
pub use server::{RelayServer, RelayServerBuilder};
pub use shutdown::ShutdownOutcome;
pub use websocket::connection::{CloseReason, ConnectionId, ConnectionState};
pub use websocket::frame::{Frame, Inbound};
pub use websocket::registry::{BroadcastReport, DeliveryFailure};

/// Queue-full drops tolerated before a slow client is evicted.
pub const DEFAULT_MAX_DROPPED_FRAMES: u64 = 100;
