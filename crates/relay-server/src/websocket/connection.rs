//! Per-client connection state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::frame::Frame;
use crate::config::MessageLimit;
use crate::errors::SendError;

/// Opaque connection identifier. Time-ordered, so registry iteration follows
/// connect order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Fresh identifier.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Upgraded but not yet registered.
    Connecting = 0,
    /// Registered and accepting frames.
    Open = 1,
    /// Close initiated; queued frames may still be flushed.
    Closing = 2,
    /// Socket released.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or hung up.
    ClientClosed,
    /// The server is being disposed.
    ServerShutdown,
    /// Reading from the socket failed.
    TransportError(String),
    /// An inbound frame exceeded the limit under the `close` policy.
    MessageTooLarge,
    /// No pong or other traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// Too many frames dropped on a full outbound queue.
    SlowConsumer,
    /// A socket write did not complete in time.
    WriteTimeout,
}

impl CloseReason {
    /// WebSocket close status code sent to the peer.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::ServerShutdown => 1001,
            Self::TransportError(_) => 1002,
            Self::SlowConsumer => 1008,
            Self::MessageTooLarge => 1009,
            Self::HeartbeatTimeout | Self::WriteTimeout => 1011,
        }
    }

    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ServerShutdown => "server_shutdown",
            Self::TransportError(_) => "transport_error",
            Self::MessageTooLarge => "message_too_large",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::WriteTimeout => "write_timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportError(cause) => write!(f, "transport error: {cause}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One live client.
///
/// Writes never touch the socket directly: [`Connection::send`] enqueues on a
/// bounded channel drained by the session's writer task, so it never blocks.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    state: AtomicU8,
    limit: MessageLimit,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    connected_at: Instant,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_frames: AtomicU64,
    registered: AtomicBool,
}

impl Connection {
    /// New connection in the `Connecting` state.
    ///
    /// `cancel` fires when the connection starts closing; the session tasks
    /// select on it.
    pub fn new(
        id: ConnectionId,
        tx: mpsc::Sender<Frame>,
        limit: MessageLimit,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            limit,
            cancel,
            close_reason: Mutex::new(None),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
            registered: AtomicBool::new(false),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether frames are currently accepted.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// `Connecting -> Open`. Returns `false` if the connection was closed first.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Flag the connection as counted among the live connections.
    pub(crate) fn set_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// Clear the live flag. `true` only for the call that cleared it, so a
    /// connection is accounted as disconnected once whoever removed it.
    pub(crate) fn take_registered(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    /// Queue a frame for this client without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.limit.check(frame.len())?;
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Begin closing. Only the first call records a reason and fires the
    /// cancellation token; later calls return `false`.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        *self.close_reason.lock() = Some(reason);
        self.cancel.cancel();
        true
    }

    /// Final transition to `Closed`. Returns `true` exactly once.
    pub fn mark_closed(&self) -> bool {
        self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel)
            != ConnectionState::Closed as u8
    }

    /// Reason recorded by the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Token cancelled when the connection starts closing.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record inbound traffic (data, ping or pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Read and reset the alive flag. `true` if traffic arrived since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound traffic.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Frames dropped on a full queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dropped_frames", &self.drop_count())
            .finish_non_exhaustive()
    }
}
