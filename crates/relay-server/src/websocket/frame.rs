//! Outbound and inbound message payloads.

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;

/// An outbound frame queued for one or more connections.
///
/// Both variants are reference counted, so fanning a frame out to many
/// connections clones a pointer, not the payload.
#[derive(Clone, Debug)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(Utf8Bytes),
    /// Binary frame.
    Binary(Bytes),
}

impl Frame {
    /// Text frame from anything string-like.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Utf8Bytes::from(text.into()))
    }

    /// Binary frame from anything byte-like.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.as_str().len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `"text"` or `"binary"`, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        }
    }
}

/// A data frame received from a client.
#[derive(Clone, Debug)]
pub enum Inbound {
    /// Text payload.
    Text(Utf8Bytes),
    /// Binary payload; the meaningful bytes are `data[offset..offset + length]`.
    Binary {
        /// Received buffer.
        data: Bytes,
        /// Start of the payload within `data`.
        offset: usize,
        /// Payload length.
        length: usize,
    },
}

impl Inbound {
    /// Binary inbound covering the whole buffer.
    pub fn binary(data: Bytes) -> Self {
        let length = data.len();
        Self::Binary {
            data,
            offset: 0,
            length,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.as_str().len(),
            Self::Binary { length, .. } => *length,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `"text"` or `"binary"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary { .. } => "binary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_len_is_utf8_bytes() {
        let frame = Frame::text("héllo");
        assert_eq!(frame.len(), 6);
        assert_eq!(frame.kind(), "text");
    }

    #[test]
    fn binary_frame_converts_to_message() {
        let frame = Frame::binary(vec![1u8, 2, 3]);
        assert_eq!(frame.len(), 3);
        match Message::from(frame) {
            Message::Binary(data) => assert_eq!(&data[..], &[1, 2, 3]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn text_frame_converts_to_message() {
        match Message::from(Frame::text("hi")) {
            Message::Text(text) => assert_eq!(text.as_str(), "hi"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn empty_frames() {
        assert!(Frame::text("").is_empty());
        assert!(Inbound::binary(Bytes::new()).is_empty());
    }

    #[test]
    fn inbound_binary_spans_whole_buffer() {
        let inbound = Inbound::binary(Bytes::from_static(b"abcd"));
        match inbound {
            Inbound::Binary { offset, length, .. } => {
                assert_eq!(offset, 0);
                assert_eq!(length, 4);
            }
            Inbound::Text(_) => panic!("expected binary"),
        }
    }
}
