//! Device lease manager.
//!
//! Physical devices are identified by a stable id derived from USB VID/PID
//! and serial number, so unplug/replug (which may change the OS port path)
//! preserves identity. Enumeration is pluggable through
//! [`DeviceEnumerator`]; the manager consumes inventories and arbitrates
//! leases.
//!
//! # Lease semantics
//!
//! - EXCLUSIVE: one holder per device. The holder chooses whether
//!   concurrent MONITOR leases are tolerated (`allows_monitors`).
//! - MONITOR: read-only observers; any number coexist if no exclusive
//!   lease exists or the exclusive lease permits them.
//! - Preemption atomically revokes the current exclusive lease and grants
//!   a new one; the caller is responsible for notifying the preempted
//!   client before reporting the new lease (the server handler does this).

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use fbuild_core::{ClientId, DeviceId, LeaseId, sha256_hex};

/// One enumerated device, as reported by a [`DeviceEnumerator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable identity.
    pub device_id: DeviceId,
    /// Current OS port path (may change across replug).
    pub port: String,
    /// USB vendor id, when known.
    pub vid: Option<u16>,
    /// USB product id, when known.
    pub pid: Option<u16>,
    /// USB serial number, when known.
    pub serial_number: Option<String>,
    /// Human-readable product description.
    pub description: String,
}

impl DeviceInfo {
    /// Derive the stable device id from VID/PID and serial number,
    /// falling back to the port path for devices without USB identity.
    #[must_use]
    pub fn stable_id(
        vid: Option<u16>,
        pid: Option<u16>,
        serial_number: Option<&str>,
        port: &str,
    ) -> DeviceId {
        let raw = match (vid, pid, serial_number) {
            (Some(v), Some(p), Some(sn)) => format!("{v:04x}:{p:04x}:{sn}"),
            (Some(v), Some(p), None) => format!("{v:04x}:{p:04x}:{port}"),
            _ => format!("port:{port}"),
        };
        DeviceId::new(format!("usb-{}", &sha256_hex(raw.as_bytes())[..16]))
    }
}

/// Supplies the current device inventory.
pub trait DeviceEnumerator: Send + Sync {
    /// Enumerate currently-connected devices.
    fn enumerate(&self) -> Vec<DeviceInfo>;
}

/// Enumerator backed by `serialport::available_ports`.
#[derive(Debug, Default)]
pub struct SerialPortEnumerator;

impl DeviceEnumerator for SerialPortEnumerator {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        let Ok(ports) = serialport::available_ports() else {
            return Vec::new();
        };
        ports
            .into_iter()
            .map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => DeviceInfo {
                    device_id: DeviceInfo::stable_id(
                        Some(usb.vid),
                        Some(usb.pid),
                        usb.serial_number.as_deref(),
                        &p.port_name,
                    ),
                    port: p.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                    description: usb.product.unwrap_or_default(),
                },
                _ => DeviceInfo {
                    device_id: DeviceInfo::stable_id(None, None, None, &p.port_name),
                    port: p.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    description: String::new(),
                },
            })
            .collect()
    }
}

/// Fixed inventory, for tests and headless setups.
#[derive(Debug, Default)]
pub struct StaticEnumerator {
    devices: Vec<DeviceInfo>,
}

impl StaticEnumerator {
    /// Create an enumerator always reporting `devices`.
    #[must_use]
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }
}

/// Lease type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseType {
    /// Full control of the device.
    Exclusive,
    /// Read-only observation.
    Monitor,
}

impl LeaseType {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Monitor => "monitor",
        }
    }
}

/// A granted lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Lease identity.
    pub lease_id: LeaseId,
    /// Owning client.
    pub client_id: ClientId,
    /// Leased device.
    pub device_id: DeviceId,
    /// Exclusive or monitor.
    pub lease_type: LeaseType,
    /// Human-readable purpose.
    pub description: String,
    /// Whether concurrent monitors are tolerated (exclusive leases only).
    pub allows_monitors: bool,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DeviceRecord {
    info: DeviceInfo,
    connected: bool,
    exclusive: Option<Lease>,
    monitors: HashMap<LeaseId, Lease>,
}

impl DeviceRecord {
    fn monitors_allowed(&self) -> bool {
        self.exclusive.as_ref().is_none_or(|l| l.allows_monitors)
    }

    fn status_json(&self) -> Value {
        json!({
            "exists": true,
            "device_id": self.info.device_id,
            "port": self.info.port,
            "description": self.info.description,
            "is_connected": self.connected,
            "exclusive_lease": self.exclusive,
            "monitor_leases": self.monitors.values().collect::<Vec<_>>(),
            "monitor_count": self.monitors.len(),
            "allows_monitors": self.monitors_allowed(),
        })
    }
}

/// The device lease manager.
pub struct DeviceLeaseManager {
    devices: Mutex<HashMap<DeviceId, DeviceRecord>>,
    released: Condvar,
    enumerator: Box<dyn DeviceEnumerator>,
}

impl std::fmt::Debug for DeviceLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLeaseManager").finish_non_exhaustive()
    }
}

impl DeviceLeaseManager {
    /// Create a manager over the given enumerator and take an initial
    /// inventory.
    #[must_use]
    pub fn new(enumerator: Box<dyn DeviceEnumerator>) -> Self {
        let manager = Self {
            devices: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            enumerator,
        };
        manager.refresh_devices();
        manager
    }

    /// Re-enumerate devices. Known devices keep their leases; port paths
    /// and connectivity are refreshed, departed devices are flagged
    /// disconnected.
    pub fn refresh_devices(&self) -> usize {
        let inventory = self.enumerator.enumerate();
        let mut devices = self.devices.lock().expect("device map mutex poisoned");

        for record in devices.values_mut() {
            record.connected = false;
        }
        let found = inventory.len();
        for info in inventory {
            match devices.get_mut(&info.device_id) {
                Some(record) => {
                    record.info = info;
                    record.connected = true;
                },
                None => {
                    debug!(device_id = %info.device_id, port = %info.port, "device discovered");
                    devices.insert(
                        info.device_id.clone(),
                        DeviceRecord {
                            info,
                            connected: true,
                            exclusive: None,
                            monitors: HashMap::new(),
                        },
                    );
                },
            }
        }
        found
    }

    /// Snapshot of all known devices.
    #[must_use]
    pub fn list_devices(&self, include_disconnected: bool) -> Vec<Value> {
        let devices = self.devices.lock().expect("device map mutex poisoned");
        devices
            .values()
            .filter(|r| include_disconnected || r.connected)
            .map(DeviceRecord::status_json)
            .collect()
    }

    /// Status for one device, or `{"exists": false}` when unknown.
    #[must_use]
    pub fn device_status(&self, device_id: &DeviceId) -> Value {
        let devices = self.devices.lock().expect("device map mutex poisoned");
        devices
            .get(device_id)
            .map_or_else(|| json!({ "exists": false, "device_id": device_id }), DeviceRecord::status_json)
    }

    /// Total lease count across all devices.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        let devices = self.devices.lock().expect("device map mutex poisoned");
        devices
            .values()
            .map(|r| usize::from(r.exclusive.is_some()) + r.monitors.len())
            .sum()
    }

    /// Acquire an exclusive lease, waiting up to `timeout_secs` for an
    /// existing exclusive lease to clear. Returns `None` on timeout or for
    /// unknown devices.
    pub fn acquire_exclusive(
        &self,
        device_id: &DeviceId,
        client_id: &ClientId,
        description: &str,
        allows_monitors: bool,
        timeout_secs: f64,
    ) -> Option<Lease> {
        let deadline = Instant::now()
            + Duration::from_secs_f64(timeout_secs.clamp(0.0, 365.0 * 24.0 * 3600.0));
        let mut devices = self.devices.lock().expect("device map mutex poisoned");

        loop {
            let record = devices.get_mut(device_id)?;
            if record.exclusive.is_none() {
                let lease = Lease {
                    lease_id: LeaseId::generate(),
                    client_id: client_id.clone(),
                    device_id: device_id.clone(),
                    lease_type: LeaseType::Exclusive,
                    description: description.to_owned(),
                    allows_monitors,
                    acquired_at: Utc::now(),
                };
                record.exclusive = Some(lease.clone());
                info!(%client_id, %device_id, lease_id = %lease.lease_id, "exclusive lease granted");
                return Some(lease);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(devices, remaining)
                .expect("device map mutex poisoned");
            devices = guard;
        }
    }

    /// Acquire a monitor lease. Fails when an exclusive lease forbids
    /// monitors, or for unknown devices.
    pub fn acquire_monitor(
        &self,
        device_id: &DeviceId,
        client_id: &ClientId,
        description: &str,
    ) -> Option<Lease> {
        let mut devices = self.devices.lock().expect("device map mutex poisoned");
        let record = devices.get_mut(device_id)?;
        if !record.monitors_allowed() {
            return None;
        }
        let lease = Lease {
            lease_id: LeaseId::generate(),
            client_id: client_id.clone(),
            device_id: device_id.clone(),
            lease_type: LeaseType::Monitor,
            description: description.to_owned(),
            allows_monitors: false,
            acquired_at: Utc::now(),
        };
        record.monitors.insert(lease.lease_id.clone(), lease.clone());
        info!(%client_id, %device_id, lease_id = %lease.lease_id, "monitor lease granted");
        Some(lease)
    }

    /// Release a lease owned by `client_id`. Returns false when the lease
    /// is unknown or owned by someone else.
    pub fn release_lease(&self, lease_id: &LeaseId, client_id: &ClientId) -> bool {
        let mut devices = self.devices.lock().expect("device map mutex poisoned");
        for record in devices.values_mut() {
            if let Some(exclusive) = &record.exclusive
                && exclusive.lease_id == *lease_id
            {
                if exclusive.client_id != *client_id {
                    return false;
                }
                record.exclusive = None;
                self.released.notify_all();
                debug!(%lease_id, "exclusive lease released");
                return true;
            }
            if let Some(monitor) = record.monitors.get(lease_id) {
                if monitor.client_id != *client_id {
                    return false;
                }
                record.monitors.remove(lease_id);
                debug!(%lease_id, "monitor lease released");
                return true;
            }
        }
        false
    }

    /// Cascade cleanup on client death. Returns the number of leases
    /// released.
    pub fn release_all_client_leases(&self, client_id: &ClientId) -> usize {
        let mut devices = self.devices.lock().expect("device map mutex poisoned");
        let mut released = 0;
        for record in devices.values_mut() {
            if record
                .exclusive
                .as_ref()
                .is_some_and(|l| l.client_id == *client_id)
            {
                record.exclusive = None;
                released += 1;
            }
            let before = record.monitors.len();
            record.monitors.retain(|_, l| l.client_id != *client_id);
            released += before - record.monitors.len();
        }
        if released > 0 {
            info!(%client_id, count = released, "released device leases for departed client");
            self.released.notify_all();
        }
        released
    }

    /// Atomically transfer the exclusive lease to `requesting_client_id`.
    ///
    /// Returns the new lease and the preempted client (if an exclusive
    /// lease existed). Fails for unknown devices. The reason is recorded
    /// for the audit trail; the server validates non-emptiness before
    /// calling.
    pub fn preempt_device(
        &self,
        device_id: &DeviceId,
        requesting_client_id: &ClientId,
        reason: &str,
    ) -> Option<(Lease, Option<ClientId>)> {
        let mut devices = self.devices.lock().expect("device map mutex poisoned");
        let record = devices.get_mut(device_id)?;

        let preempted = record.exclusive.take().map(|l| l.client_id);
        let lease = Lease {
            lease_id: LeaseId::generate(),
            client_id: requesting_client_id.clone(),
            device_id: device_id.clone(),
            lease_type: LeaseType::Exclusive,
            description: format!("preempted: {reason}"),
            allows_monitors: true,
            acquired_at: Utc::now(),
        };
        record.exclusive = Some(lease.clone());
        warn!(
            %device_id,
            new_holder = %requesting_client_id,
            preempted = ?preempted,
            reason,
            "exclusive lease preempted"
        );
        Some((lease, preempted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::new(format!("usb-{n:03}")),
            port: format!("/dev/ttyUSB{n}"),
            vid: Some(0x303a),
            pid: Some(0x1001),
            serial_number: Some(format!("SN{n}")),
            description: "ESP32-S3".into(),
        }
    }

    fn manager() -> DeviceLeaseManager {
        DeviceLeaseManager::new(Box::new(StaticEnumerator::new(vec![device(1), device(2)])))
    }

    fn id(n: u8) -> DeviceId {
        DeviceId::new(format!("usb-{n:03}"))
    }

    fn client(s: &str) -> ClientId {
        ClientId::new(s)
    }

    #[test]
    fn test_stable_id_survives_port_change() {
        let a = DeviceInfo::stable_id(Some(0x303a), Some(0x1001), Some("SN1"), "/dev/ttyUSB0");
        let b = DeviceInfo::stable_id(Some(0x303a), Some(0x1001), Some("SN1"), "/dev/ttyUSB5");
        assert_eq!(a, b);
        let c = DeviceInfo::stable_id(Some(0x303a), Some(0x1001), Some("SN2"), "/dev/ttyUSB0");
        assert_ne!(a, c);
    }

    #[test]
    fn test_exclusive_excludes_exclusive() {
        let mgr = manager();
        let lease = mgr
            .acquire_exclusive(&id(1), &client("a"), "flash", true, 0.0)
            .unwrap();
        assert!(mgr
            .acquire_exclusive(&id(1), &client("b"), "", true, 0.0)
            .is_none());
        // A different device is unaffected.
        assert!(mgr
            .acquire_exclusive(&id(2), &client("b"), "", true, 0.0)
            .is_some());
        assert!(mgr.release_lease(&lease.lease_id, &client("a")));
        assert!(mgr
            .acquire_exclusive(&id(1), &client("b"), "", true, 0.0)
            .is_some());
    }

    #[test]
    fn test_unknown_device_yields_no_lease() {
        let mgr = manager();
        assert!(mgr
            .acquire_exclusive(&DeviceId::new("ghost"), &client("a"), "", true, 0.0)
            .is_none());
        assert!(mgr
            .acquire_monitor(&DeviceId::new("ghost"), &client("a"), "")
            .is_none());
    }

    #[test]
    fn test_monitors_follow_allows_monitors_flag() {
        let mgr = manager();
        let _excl = mgr
            .acquire_exclusive(&id(1), &client("a"), "", false, 0.0)
            .unwrap();
        // allows_monitors=false: no monitors may attach.
        assert!(mgr.acquire_monitor(&id(1), &client("b"), "").is_none());

        let _excl2 = mgr
            .acquire_exclusive(&id(2), &client("a"), "", true, 0.0)
            .unwrap();
        assert!(mgr.acquire_monitor(&id(2), &client("b"), "").is_some());
        assert!(mgr.acquire_monitor(&id(2), &client("c"), "").is_some());
        assert_eq!(mgr.lease_count(), 4);
    }

    #[test]
    fn test_monitors_without_exclusive() {
        let mgr = manager();
        assert!(mgr.acquire_monitor(&id(1), &client("a"), "").is_some());
        assert!(mgr.acquire_monitor(&id(1), &client("b"), "").is_some());
    }

    #[test]
    fn test_release_wrong_owner_fails() {
        let mgr = manager();
        let lease = mgr
            .acquire_exclusive(&id(1), &client("a"), "", true, 0.0)
            .unwrap();
        assert!(!mgr.release_lease(&lease.lease_id, &client("b")));
        assert!(mgr.release_lease(&lease.lease_id, &client("a")));
        assert!(!mgr.release_lease(&lease.lease_id, &client("a")));
    }

    #[test]
    fn test_release_all_client_leases() {
        let mgr = manager();
        mgr.acquire_exclusive(&id(1), &client("a"), "", true, 0.0)
            .unwrap();
        mgr.acquire_monitor(&id(2), &client("a"), "").unwrap();
        mgr.acquire_monitor(&id(2), &client("b"), "").unwrap();

        assert_eq!(mgr.release_all_client_leases(&client("a")), 2);
        assert_eq!(mgr.lease_count(), 1);
    }

    #[test]
    fn test_preemption_transfers_exclusive() {
        let mgr = manager();
        let original = mgr
            .acquire_exclusive(&id(1), &client("a"), "", true, 0.0)
            .unwrap();
        let (new_lease, preempted) = mgr
            .preempt_device(&id(1), &client("c"), "CI takeover")
            .unwrap();

        assert_eq!(preempted, Some(client("a")));
        assert_eq!(new_lease.client_id, client("c"));
        assert_eq!(new_lease.lease_type, LeaseType::Exclusive);
        assert_ne!(new_lease.lease_id, original.lease_id);

        // The preempted client's release is a quiet false.
        assert!(!mgr.release_lease(&original.lease_id, &client("a")));
    }

    #[test]
    fn test_preemption_without_holder_still_grants() {
        let mgr = manager();
        let (lease, preempted) = mgr.preempt_device(&id(1), &client("c"), "setup").unwrap();
        assert!(preempted.is_none());
        assert_eq!(lease.client_id, client("c"));
    }

    #[test]
    fn test_refresh_preserves_leases() {
        let mgr = manager();
        let lease = mgr
            .acquire_exclusive(&id(1), &client("a"), "", true, 0.0)
            .unwrap();
        mgr.refresh_devices();
        let status = mgr.device_status(&id(1));
        assert_eq!(status["exclusive_lease"]["lease_id"], lease.lease_id.as_str());
        assert_eq!(status["is_connected"], true);
    }

    #[test]
    fn test_list_devices_filters_disconnected() {
        let mgr = DeviceLeaseManager::new(Box::new(StaticEnumerator::new(vec![device(1)])));
        assert_eq!(mgr.list_devices(false).len(), 1);
        assert_eq!(mgr.list_devices(true).len(), 1);
    }

    #[test]
    fn test_blocking_exclusive_waits_for_release() {
        let mgr = std::sync::Arc::new(manager());
        let lease = mgr
            .acquire_exclusive(&id(1), &client("a"), "", true, 0.0)
            .unwrap();

        let releaser = {
            let mgr = std::sync::Arc::clone(&mgr);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                assert!(mgr.release_lease(&lease.lease_id, &client("a")));
            })
        };

        let started = Instant::now();
        let second = mgr.acquire_exclusive(&id(1), &client("b"), "", true, 5.0);
        releaser.join().unwrap();

        let second = second.expect("waiter should win the lease after release");
        assert_eq!(second.client_id, client("b"));
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
