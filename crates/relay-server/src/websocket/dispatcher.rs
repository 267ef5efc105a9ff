//! Routes inbound frames to the host's handlers.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use tracing::{debug, error, trace};

use super::connection::ConnectionId;
use super::frame::Inbound;
use crate::callbacks::{Capability, HostCallbacks};
use crate::metrics::{WS_CALLBACK_PANICS_TOTAL, WS_FRAMES_UNHANDLED_TOTAL};

/// Result of dispatching one inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion.
    Delivered,
    /// No handler for this frame kind; the frame was discarded.
    Unhandled,
    /// The handler panicked; the panic was contained.
    Panicked,
}

/// Invokes host handlers, containing panics so one misbehaving message
/// cannot take down the connection or the server.
pub struct Dispatcher {
    callbacks: HostCallbacks,
    capability: Capability,
    panics: AtomicU64,
}

impl Dispatcher {
    /// Dispatcher over `callbacks`; the capability is captured here once.
    pub fn new(callbacks: HostCallbacks) -> Self {
        let capability = callbacks.capability();
        debug!(?capability, "host capability resolved");
        Self {
            callbacks,
            capability,
            panics: AtomicU64::new(0),
        }
    }

    /// Capability resolved at construction.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Handler panics contained so far.
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Deliver one inbound frame. Runs on the connection's reader, so frames
    /// from one connection are delivered in arrival order.
    pub fn dispatch(&self, conn_id: &ConnectionId, inbound: &Inbound) -> DispatchOutcome {
        let result = match inbound {
            Inbound::Text(text) => {
                let Some(handler) = self.callbacks.text_handler() else {
                    return self.unhandled(conn_id, inbound);
                };
                catch_unwind(AssertUnwindSafe(|| handler.on_text(text.as_str())))
            }
            Inbound::Binary {
                data,
                offset,
                length,
            } => {
                let Some(handler) = self.callbacks.binary_handler() else {
                    return self.unhandled(conn_id, inbound);
                };
                catch_unwind(AssertUnwindSafe(|| {
                    handler.on_binary(data, *offset, *length);
                }))
            }
        };

        match result {
            Ok(()) => DispatchOutcome::Delivered,
            Err(payload) => {
                let _ = self.panics.fetch_add(1, Ordering::Relaxed);
                counter!(WS_CALLBACK_PANICS_TOTAL).increment(1);
                error!(
                    conn_id = %conn_id,
                    kind = inbound.kind(),
                    panic = panic_message(payload.as_ref()),
                    "host handler panicked"
                );
                DispatchOutcome::Panicked
            }
        }
    }

    fn unhandled(&self, conn_id: &ConnectionId, inbound: &Inbound) -> DispatchOutcome {
        counter!(WS_FRAMES_UNHANDLED_TOTAL, "kind" => inbound.kind()).increment(1);
        trace!(
            conn_id = %conn_id,
            kind = inbound.kind(),
            capability = ?self.capability,
            "no handler for inbound frame, discarding"
        );
        DispatchOutcome::Unhandled
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
