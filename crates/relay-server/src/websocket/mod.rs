//! WebSocket connection management, heartbeat, message dispatch, and broadcasting.

pub mod connection;
pub mod dispatcher;
pub mod frame;
pub mod heartbeat;
pub mod registry;
pub mod session;
