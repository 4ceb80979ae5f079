//! Message envelope and type tags.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fbuild_core::{ClientId, RequestId};

use crate::error::ProtocolError;

/// Event categories a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Configuration lock state changes.
    Locks,
    /// Firmware deployment events.
    Firmware,
    /// Serial port events and output.
    Serial,
    /// Device lease events.
    Devices,
    /// Daemon status updates.
    Status,
    /// Every event category.
    All,
}

impl SubscriptionType {
    /// Parse a wire string into a subscription type.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownSubscriptionType`] for unrecognized
    /// names.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "locks" => Ok(Self::Locks),
            "firmware" => Ok(Self::Firmware),
            "serial" => Ok(Self::Serial),
            "devices" => Ok(Self::Devices),
            "status" => Ok(Self::Status),
            "all" => Ok(Self::All),
            other => Err(ProtocolError::UnknownSubscriptionType(other.to_owned())),
        }
    }

    /// The wire name of this subscription type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locks => "locks",
            Self::Firmware => "firmware",
            Self::Serial => "serial",
            Self::Devices => "devices",
            Self::Status => "status",
            Self::All => "all",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Client lifecycle
    /// Client introduces itself.
    Connect,
    /// Liveness beacon.
    Heartbeat,
    /// Graceful goodbye.
    Disconnect,

    // Lock operations
    /// Acquire a configuration lock.
    LockAcquire,
    /// Release a configuration lock.
    LockRelease,
    /// Query a configuration lock.
    LockStatus,

    // Firmware operations
    /// Ask whether deployed firmware is current.
    FirmwareQuery,
    /// Record a completed deployment.
    FirmwareRecord,

    // Serial operations
    /// Attach to a serial session (opening the port if needed).
    SerialAttach,
    /// Detach from a serial session.
    SerialDetach,
    /// Acquire the session's writer slot.
    SerialAcquireWriter,
    /// Release the session's writer slot.
    SerialReleaseWriter,
    /// Write bytes to the port.
    SerialWrite,
    /// Drain buffered output lines.
    SerialReadBuffer,

    // Device operations
    /// Enumerate devices.
    DeviceList,
    /// Acquire a device lease.
    DeviceLease,
    /// Release a device lease.
    DeviceRelease,
    /// Preempt the exclusive lease on a device.
    DevicePreempt,
    /// Query one device.
    DeviceStatus,

    // Subscriptions
    /// Subscribe to event categories.
    Subscribe,
    /// Unsubscribe from event categories.
    Unsubscribe,

    // Server -> client
    /// Successful reply to a request.
    Response,
    /// Error reply to a request.
    Error,
    /// Pushed event for a subscription.
    Broadcast,
}

impl MessageType {
    /// Parse a wire `type` tag.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownMessageType`] for unrecognized tags.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_value(Value::String(s.to_owned()))
            .map_err(|_| ProtocolError::UnknownMessageType(s.to_owned()))
    }

    /// The wire name of this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Heartbeat => "heartbeat",
            Self::Disconnect => "disconnect",
            Self::LockAcquire => "lock_acquire",
            Self::LockRelease => "lock_release",
            Self::LockStatus => "lock_status",
            Self::FirmwareQuery => "firmware_query",
            Self::FirmwareRecord => "firmware_record",
            Self::SerialAttach => "serial_attach",
            Self::SerialDetach => "serial_detach",
            Self::SerialAcquireWriter => "serial_acquire_writer",
            Self::SerialReleaseWriter => "serial_release_writer",
            Self::SerialWrite => "serial_write",
            Self::SerialReadBuffer => "serial_read_buffer",
            Self::DeviceList => "device_list",
            Self::DeviceLease => "device_lease",
            Self::DeviceRelease => "device_release",
            Self::DevicePreempt => "device_preempt",
            Self::DeviceStatus => "device_status",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Response => "response",
            Self::Error => "error",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch, as carried on the wire.
#[must_use]
pub fn wire_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message type tag.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Client identity; absent only on the very first CONNECT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Request correlation id; echoed on the matching response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: f64,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Build a client request with a fresh `request_id`.
    #[must_use]
    pub fn request(msg_type: MessageType, client_id: Option<ClientId>, data: Value) -> Self {
        Self {
            msg_type,
            client_id,
            request_id: Some(RequestId::generate()),
            timestamp: wire_timestamp(),
            data,
        }
    }

    /// Build a RESPONSE echoing a request id.
    #[must_use]
    pub fn response(request_id: Option<RequestId>, data: Value) -> Self {
        Self {
            msg_type: MessageType::Response,
            client_id: None,
            request_id,
            timestamp: wire_timestamp(),
            data,
        }
    }

    /// Build an ERROR reply.
    #[must_use]
    pub fn error(request_id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Error,
            client_id: None,
            request_id,
            timestamp: wire_timestamp(),
            data: serde_json::json!({ "success": false, "error": message.into() }),
        }
    }

    /// Build a BROADCAST frame for an event category.
    #[must_use]
    pub fn broadcast(event_type: &str, data: Value) -> Self {
        Self {
            msg_type: MessageType::Broadcast,
            client_id: None,
            request_id: None,
            timestamp: wire_timestamp(),
            data: serde_json::json!({ "event_type": event_type, "data": data }),
        }
    }

    /// Serialize to wire bytes, including the trailing delimiter.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // The envelope contains no map keys that can fail to serialize.
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }

    /// Parse one frame (without its delimiter).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] for malformed JSON and
    /// [`ProtocolError::UnknownMessageType`] for unknown tags.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        // Pull the tag out first so an unknown type yields the precise error
        // rather than a generic serde failure.
        let value: Value =
            serde_json::from_slice(frame).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?;
        MessageType::parse(tag)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_request() {
        let msg = Message::request(
            MessageType::LockAcquire,
            Some(ClientId::new("c1")),
            serde_json::json!({ "project_dir": "/p", "environment": "e", "port": "" }),
        );
        let bytes = msg.encode();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        let back = Message::decode(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(back.msg_type, MessageType::LockAcquire);
        assert_eq!(back.client_id, Some(ClientId::new("c1")));
        assert_eq!(back.request_id, msg.request_id);
    }

    #[test]
    fn test_unknown_type_is_precise() {
        let err = Message::decode(br#"{"type":"frobnicate","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(t) if t == "frobnicate"));
    }

    #[test]
    fn test_missing_type_field() {
        let err = Message::decode(br#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("type")));
    }

    #[test]
    fn test_subscription_parse() {
        assert_eq!(SubscriptionType::parse("all").unwrap(), SubscriptionType::All);
        assert!(SubscriptionType::parse("everything").is_err());
    }
}
