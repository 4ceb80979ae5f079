//! fbuild wire protocol.
//!
//! Messages are UTF-8 JSON objects terminated by a single `\n`. Every
//! message carries a `type` tag, an optional `client_id` (assigned by the
//! server on connect and echoed by clients afterwards), an optional
//! `request_id` (echoed on the matching response), an epoch-seconds
//! `timestamp`, and a type-specific `data` object.
//!
//! The crate is transport-agnostic: [`FrameReader`] turns raw socket reads
//! into complete frames, [`Message::encode`] produces the bytes to write.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod framing;
mod message;
mod payload;

pub use error::ProtocolError;
pub use framing::{FrameReader, MAX_FRAME_SIZE};
pub use message::{Message, MessageType, SubscriptionType, wire_timestamp};
pub use payload::{
    ConnectData, DeviceLeaseData, DevicePreemptData, DeviceReleaseData, FirmwareQueryData,
    FirmwareRecordData, LockAcquireData, LockReleaseData, LockType, SerialAttachData,
    SerialDetachData, SerialReadData, SerialWriteData, SerialWriterData, SubscribeData,
    decode_payload,
};

/// Encode raw bytes for embedding in a JSON `data` field.
#[must_use]
pub fn encode_bytes(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a base64 `data` field back into raw bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidBase64`] when the input is not valid
/// base64.
pub fn decode_bytes(data: &str) -> Result<Vec<u8>, ProtocolError> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))
}
