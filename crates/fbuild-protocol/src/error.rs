//! Protocol error types.

use thiserror::Error;

/// Errors produced while framing or interpreting wire messages.
///
/// A framing or format error is answered with an ERROR reply on the
/// offending connection; it never tears the connection down by itself.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeded the size bound before a delimiter was seen.
    #[error("frame exceeds maximum size of {max} bytes")]
    FrameTooLarge {
        /// The configured bound.
        max: usize,
    },

    /// The frame was not valid UTF-8 JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The message lacked a required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The `type` tag named no known message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A subscription request named no known event type.
    #[error("unknown subscription type: {0}")]
    UnknownSubscriptionType(String),

    /// A `data` payload did not match the shape its message type requires.
    #[error("invalid payload for {message_type}: {detail}")]
    InvalidPayload {
        /// The message type whose payload failed to decode.
        message_type: String,
        /// Decoder detail.
        detail: String,
    },

    /// A base64-encoded field failed to decode.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}
