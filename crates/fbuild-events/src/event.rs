//! Daemon event variants.

use serde_json::{Value, json};

use fbuild_core::{ClientId, ConfigKey, DeviceId, LeaseId};
use fbuild_protocol::SubscriptionType;

/// An observable state change inside the daemon.
///
/// Every variant maps onto one wire subscription category and serializes to
/// the `data` object of a BROADCAST frame.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A client completed the CONNECT exchange.
    ClientConnected {
        /// The new client.
        client_id: ClientId,
    },
    /// A client disconnected (gracefully or via the dead-client sweep).
    ClientDisconnected {
        /// The departed client.
        client_id: ClientId,
        /// Why the connection ended.
        reason: String,
    },
    /// The daemon's status record changed.
    StatusChanged {
        /// New state name.
        state: String,
        /// Human-readable detail.
        message: String,
    },
    /// A configuration lock was acquired.
    LockAcquired {
        /// Holder.
        client_id: ClientId,
        /// Lock key.
        key: ConfigKey,
        /// `"exclusive"` or `"shared_read"`.
        lock_type: String,
    },
    /// A configuration lock was released by its holder.
    LockReleased {
        /// Former holder.
        client_id: ClientId,
        /// Lock key.
        key: ConfigKey,
    },
    /// The janitor force-released stale locks.
    StaleLocksReleased {
        /// How many locks were cleared.
        count: usize,
    },
    /// A device lease was granted.
    LeaseAcquired {
        /// Holder.
        client_id: ClientId,
        /// Device.
        device_id: DeviceId,
        /// Lease identity.
        lease_id: LeaseId,
        /// `"exclusive"` or `"monitor"`.
        lease_type: String,
    },
    /// A device lease was released.
    LeaseReleased {
        /// Former holder.
        client_id: ClientId,
        /// Lease identity.
        lease_id: LeaseId,
    },
    /// An exclusive lease was forcibly transferred.
    DevicePreempted {
        /// Device.
        device_id: DeviceId,
        /// New holder.
        preempted_by: ClientId,
        /// Former holder, if any.
        preempted_client_id: Option<ClientId>,
        /// Mandatory justification.
        reason: String,
    },
    /// A client attached to a serial session.
    SerialAttached {
        /// Port path.
        port: String,
        /// Attaching client.
        client_id: ClientId,
        /// Whether it attached as a reader.
        as_reader: bool,
    },
    /// A client detached from a serial session.
    SerialDetached {
        /// Port path.
        port: String,
        /// Detaching client.
        client_id: ClientId,
    },
    /// Bytes arrived from the device on an open port.
    SerialOutput {
        /// Port path.
        port: String,
        /// Base64-encoded chunk.
        data: String,
    },
    /// A serial session closed (last reader left, or the port died).
    SerialClosed {
        /// Port path.
        port: String,
        /// Why the session ended.
        reason: String,
    },
    /// A firmware deployment was recorded.
    FirmwareRecorded {
        /// Port flashed.
        port: String,
        /// Environment the build came from.
        environment: String,
        /// Image hash.
        firmware_hash: String,
    },
}

impl DaemonEvent {
    /// The subscription category this event belongs to.
    #[must_use]
    pub fn subscription_type(&self) -> SubscriptionType {
        match self {
            Self::ClientConnected { .. }
            | Self::ClientDisconnected { .. }
            | Self::StatusChanged { .. } => SubscriptionType::Status,
            Self::LockAcquired { .. }
            | Self::LockReleased { .. }
            | Self::StaleLocksReleased { .. } => SubscriptionType::Locks,
            Self::LeaseAcquired { .. }
            | Self::LeaseReleased { .. }
            | Self::DevicePreempted { .. } => SubscriptionType::Devices,
            Self::SerialAttached { .. }
            | Self::SerialDetached { .. }
            | Self::SerialOutput { .. }
            | Self::SerialClosed { .. } => SubscriptionType::Serial,
            Self::FirmwareRecorded { .. } => SubscriptionType::Firmware,
        }
    }

    /// Short event name carried in the broadcast payload.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientDisconnected { .. } => "client_disconnected",
            Self::StatusChanged { .. } => "status_changed",
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockReleased { .. } => "lock_released",
            Self::StaleLocksReleased { .. } => "stale_locks_released",
            Self::LeaseAcquired { .. } => "lease_acquired",
            Self::LeaseReleased { .. } => "lease_released",
            Self::DevicePreempted { .. } => "device_preempted",
            Self::SerialAttached { .. } => "client_attached",
            Self::SerialDetached { .. } => "client_detached",
            Self::SerialOutput { .. } => "output",
            Self::SerialClosed { .. } => "session_closed",
            Self::FirmwareRecorded { .. } => "deployment_recorded",
        }
    }

    /// The key a filtered subscription matches against: port path for serial
    /// events, device id for device events.
    #[must_use]
    pub fn filter_key(&self) -> Option<&str> {
        match self {
            Self::SerialAttached { port, .. }
            | Self::SerialDetached { port, .. }
            | Self::SerialOutput { port, .. }
            | Self::SerialClosed { port, .. }
            | Self::FirmwareRecorded { port, .. } => Some(port),
            Self::LeaseAcquired { device_id, .. } | Self::DevicePreempted { device_id, .. } => {
                Some(device_id.as_str())
            },
            _ => None,
        }
    }

    /// Serialize to the broadcast `data` object.
    #[must_use]
    pub fn payload(&self) -> Value {
        let mut value = match self {
            Self::ClientConnected { client_id } => json!({ "client_id": client_id }),
            Self::ClientDisconnected { client_id, reason } => {
                json!({ "client_id": client_id, "reason": reason })
            },
            Self::StatusChanged { state, message } => {
                json!({ "state": state, "message": message })
            },
            Self::LockAcquired {
                client_id,
                key,
                lock_type,
            } => json!({
                "client_id": client_id,
                "config_key": key,
                "lock_type": lock_type,
            }),
            Self::LockReleased { client_id, key } => {
                json!({ "client_id": client_id, "config_key": key })
            },
            Self::StaleLocksReleased { count } => json!({ "count": count }),
            Self::LeaseAcquired {
                client_id,
                device_id,
                lease_id,
                lease_type,
            } => json!({
                "client_id": client_id,
                "device_id": device_id,
                "lease_id": lease_id,
                "lease_type": lease_type,
            }),
            Self::LeaseReleased {
                client_id,
                lease_id,
            } => json!({ "client_id": client_id, "lease_id": lease_id }),
            Self::DevicePreempted {
                device_id,
                preempted_by,
                preempted_client_id,
                reason,
            } => json!({
                "device_id": device_id,
                "preempted_by": preempted_by,
                "preempted_client_id": preempted_client_id,
                "reason": reason,
            }),
            Self::SerialAttached {
                port,
                client_id,
                as_reader,
            } => json!({ "port": port, "client_id": client_id, "as_reader": as_reader }),
            Self::SerialDetached { port, client_id } => {
                json!({ "port": port, "client_id": client_id })
            },
            Self::SerialOutput { port, data } => json!({ "port": port, "data": data }),
            Self::SerialClosed { port, reason } => json!({ "port": port, "reason": reason }),
            Self::FirmwareRecorded {
                port,
                environment,
                firmware_hash,
            } => json!({
                "port": port,
                "environment": environment,
                "firmware_hash": firmware_hash,
            }),
        };
        if let Value::Object(map) = &mut value {
            map.insert("event".to_owned(), Value::String(self.event_name().into()));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_mapping() {
        let ev = DaemonEvent::LockAcquired {
            client_id: ClientId::new("c"),
            key: ConfigKey::new("/p", "e", ""),
            lock_type: "exclusive".into(),
        };
        assert_eq!(ev.subscription_type(), SubscriptionType::Locks);
        assert_eq!(ev.event_name(), "lock_acquired");
        assert!(ev.filter_key().is_none());
    }

    #[test]
    fn test_serial_filter_key_is_port() {
        let ev = DaemonEvent::SerialOutput {
            port: "/dev/ttyUSB0".into(),
            data: String::new(),
        };
        assert_eq!(ev.filter_key(), Some("/dev/ttyUSB0"));
        assert_eq!(ev.subscription_type(), SubscriptionType::Serial);
    }

    #[test]
    fn test_payload_carries_event_name() {
        let ev = DaemonEvent::StaleLocksReleased { count: 3 };
        let payload = ev.payload();
        assert_eq!(payload["event"], "stale_locks_released");
        assert_eq!(payload["count"], 3);
    }
}
