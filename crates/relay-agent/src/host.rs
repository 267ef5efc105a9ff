//! The binary's host: logs inbound messages and optionally echoes them.

use std::sync::{Arc, OnceLock};

use relay_server::{BinaryHandler, ServerController, TextHandler};
use tracing::{info, warn};

/// Host handlers for the `relay` binary.
pub struct RelayHost {
    echo: bool,
    controller: Arc<OnceLock<ServerController>>,
}

impl RelayHost {
    /// `controller` is filled in once the server has started.
    pub fn new(echo: bool, controller: Arc<OnceLock<ServerController>>) -> Self {
        Self { echo, controller }
    }

    fn controller(&self) -> Option<&ServerController> {
        if !self.echo {
            return None;
        }
        self.controller.get()
    }
}

impl TextHandler for RelayHost {
    fn on_text(&self, message: &str) {
        info!(len = message.len(), text = message, "text received");
        if let Some(ctl) = self.controller() {
            if let Err(e) = ctl.broadcast_text(message) {
                warn!(error = %e, "echo failed");
            }
        }
    }
}

impl BinaryHandler for RelayHost {
    fn on_binary(&self, data: &[u8], offset: usize, length: usize) {
        info!(len = length, "binary received");
        let Some(payload) = offset
            .checked_add(length)
            .and_then(|end| data.get(offset..end))
        else {
            warn!(offset, length, buffer = data.len(), "binary window out of range");
            return;
        };
        if let Some(ctl) = self.controller() {
            if let Err(e) = ctl.broadcast_binary(payload.to_vec()) {
                warn!(error = %e, "echo failed");
            }
        }
    }
}
