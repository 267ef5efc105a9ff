//! Host-side message handlers.
//!
//! A host supplies a text handler, a binary handler, both, or neither. The
//! capability is fixed when the server starts and never re-probed.

use std::fmt;
use std::sync::Arc;

/// Receives inbound text messages.
pub trait TextHandler: Send + Sync + 'static {
    /// Called once per inbound text frame, in per-connection arrival order.
    fn on_text(&self, message: &str);
}

/// Receives inbound binary messages.
pub trait BinaryHandler: Send + Sync + 'static {
    /// Called once per inbound binary frame with the buffer and the payload
    /// window `data[offset..offset + length]`.
    fn on_binary(&self, data: &[u8], offset: usize, length: usize);
}

impl<F> TextHandler for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn on_text(&self, message: &str) {
        self(message);
    }
}

impl<F> BinaryHandler for F
where
    F: Fn(&[u8], usize, usize) + Send + Sync + 'static,
{
    fn on_binary(&self, data: &[u8], offset: usize, length: usize) {
        self(data, offset, length);
    }
}

/// Which handlers a host provides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// No handlers; inbound data frames are discarded.
    None,
    /// Text only.
    Text,
    /// Binary only.
    Binary,
    /// Text and binary.
    Both,
}

/// The host's handlers.
#[derive(Clone, Default)]
pub struct HostCallbacks {
    text: Option<Arc<dyn TextHandler>>,
    binary: Option<Arc<dyn BinaryHandler>>,
}

impl HostCallbacks {
    /// No handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// One host object serving both kinds of message.
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: TextHandler + BinaryHandler,
    {
        Self {
            text: Some(Arc::clone(&host) as Arc<dyn TextHandler>),
            binary: Some(host as Arc<dyn BinaryHandler>),
        }
    }

    /// Set the text handler.
    #[must_use]
    pub fn with_text(mut self, handler: impl TextHandler) -> Self {
        self.text = Some(Arc::new(handler));
        self
    }

    /// Set the binary handler.
    #[must_use]
    pub fn with_binary(mut self, handler: impl BinaryHandler) -> Self {
        self.binary = Some(Arc::new(handler));
        self
    }

    /// Which handlers are present.
    pub fn capability(&self) -> Capability {
        match (self.text.is_some(), self.binary.is_some()) {
            (true, true) => Capability::Both,
            (true, false) => Capability::Text,
            (false, true) => Capability::Binary,
            (false, false) => Capability::None,
        }
    }

    pub(crate) fn text_handler(&self) -> Option<&Arc<dyn TextHandler>> {
        self.text.as_ref()
    }

    pub(crate) fn binary_handler(&self) -> Option<&Arc<dyn BinaryHandler>> {
        self.binary.as_ref()
    }
}

impl fmt::Debug for HostCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCallbacks")
            .field("capability", &self.capability())
            .finish()
    }
}
