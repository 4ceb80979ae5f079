//! Typed request payloads.
//!
//! Handlers decode the envelope's `data` object into one of these structs
//! with [`decode_payload`]; unknown extra fields are ignored, missing
//! optional fields take the documented defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fbuild_core::{ConfigKey, DeviceId, LeaseId};

use crate::error::ProtocolError;
use crate::message::MessageType;

/// Decode a `data` payload for a given message type.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] carrying the decoder detail.
pub fn decode_payload<T: serde::de::DeserializeOwned>(
    msg_type: MessageType,
    data: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        message_type: msg_type.to_string(),
        detail: e.to_string(),
    })
}

/// CONNECT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectData {
    /// Client process id.
    #[serde(default)]
    pub pid: u32,
    /// Client host name.
    #[serde(default)]
    pub hostname: String,
    /// Client software version.
    #[serde(default)]
    pub version: String,
}

/// Which form of configuration lock is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Single mutating holder.
    Exclusive,
    /// Any number of read-only holders.
    SharedRead,
}

impl LockType {
    /// The wire name of this lock type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::SharedRead => "shared_read",
        }
    }
}

/// LOCK_ACQUIRE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockAcquireData {
    /// Project directory component of the key.
    #[serde(default)]
    pub project_dir: String,
    /// Environment component of the key.
    #[serde(default)]
    pub environment: String,
    /// Port component of the key.
    #[serde(default)]
    pub port: String,
    /// Requested lock form.
    #[serde(default = "default_lock_type")]
    pub lock_type: LockType,
    /// Seconds to wait for a contended exclusive lock; also becomes the
    /// lock's staleness timeout while held.
    #[serde(default = "default_lock_timeout")]
    pub timeout: f64,
    /// Non-blocking acquisition returns immediately when contended.
    #[serde(default = "default_true")]
    pub blocking: bool,
    /// Human-readable purpose, surfaced in lock status.
    #[serde(default)]
    pub description: String,
}

impl LockAcquireData {
    /// The configuration key this request addresses.
    #[must_use]
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(&self.project_dir, &self.environment, &self.port)
    }
}

/// LOCK_RELEASE / LOCK_STATUS payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReleaseData {
    /// Project directory component of the key.
    #[serde(default)]
    pub project_dir: String,
    /// Environment component of the key.
    #[serde(default)]
    pub environment: String,
    /// Port component of the key.
    #[serde(default)]
    pub port: String,
}

impl LockReleaseData {
    /// The configuration key this request addresses.
    #[must_use]
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(&self.project_dir, &self.environment, &self.port)
    }
}

/// DEVICE_LEASE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLeaseData {
    /// Target device.
    pub device_id: DeviceId,
    /// `"exclusive"` or `"monitor"`.
    #[serde(default = "default_exclusive")]
    pub lease_type: String,
    /// Human-readable purpose.
    #[serde(default)]
    pub description: String,
    /// Whether an exclusive lease tolerates concurrent monitors.
    #[serde(default = "default_true")]
    pub allows_monitors: bool,
    /// Seconds to wait for a contended exclusive lease.
    #[serde(default = "default_lease_timeout")]
    pub timeout: f64,
}

/// DEVICE_RELEASE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReleaseData {
    /// The lease being released.
    pub lease_id: LeaseId,
}

/// DEVICE_PREEMPT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePreemptData {
    /// Target device.
    pub device_id: DeviceId,
    /// Mandatory, non-empty justification delivered to the preempted client.
    #[serde(default)]
    pub reason: String,
}

/// SERIAL_ATTACH payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialAttachData {
    /// OS port path.
    pub port: String,
    /// Baud rate for the first opener.
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Attach as a reader (the default) or only open the port.
    #[serde(default = "default_true")]
    pub as_reader: bool,
}

/// SERIAL_DETACH payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDetachData {
    /// OS port path.
    pub port: String,
}

/// SERIAL_ACQUIRE_WRITER / SERIAL_RELEASE_WRITER payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialWriterData {
    /// OS port path.
    pub port: String,
    /// Seconds to wait for the writer slot (acquire only); the server's
    /// default applies when absent.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// SERIAL_WRITE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialWriteData {
    /// OS port path.
    pub port: String,
    /// Base64-encoded bytes to write.
    #[serde(default)]
    pub data: String,
    /// Acquire (and afterwards release) the writer slot around the write.
    #[serde(default = "default_true")]
    pub acquire_writer: bool,
}

/// SERIAL_READ_BUFFER payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialReadData {
    /// OS port path.
    pub port: String,
    /// Upper bound on drained lines.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

/// FIRMWARE_QUERY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareQueryData {
    /// Port whose deployment record is queried.
    pub port: String,
    /// Source-tree hash of the candidate build.
    #[serde(default)]
    pub source_hash: String,
    /// Optional build-flags hash; when present it must also match.
    #[serde(default)]
    pub build_flags_hash: Option<String>,
}

/// FIRMWARE_RECORD payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRecordData {
    /// Port the firmware was flashed to.
    pub port: String,
    /// Hash of the flashed image.
    #[serde(default)]
    pub firmware_hash: String,
    /// Hash of the source tree it was built from.
    #[serde(default)]
    pub source_hash: String,
    /// Hash of the build flags.
    #[serde(default)]
    pub build_flags_hash: String,
    /// Owning project path.
    #[serde(default)]
    pub project_dir: String,
    /// Environment name.
    #[serde(default)]
    pub environment: String,
}

/// SUBSCRIBE / UNSUBSCRIBE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeData {
    /// Event category names (`"locks"`, `"serial"`, ...).
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Optional filter narrowing delivery (e.g. a port name for serial
    /// events).
    #[serde(default)]
    pub filter_key: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_lock_type() -> LockType {
    LockType::Exclusive
}

fn default_lock_timeout() -> f64 {
    1800.0
}

fn default_lease_timeout() -> f64 {
    300.0
}

fn default_exclusive() -> String {
    "exclusive".to_owned()
}

fn default_baud() -> u32 {
    115_200
}

fn default_max_lines() -> usize {
    100
}
