//! Shared fixtures for fbuild end-to-end tests.
//!
//! [`TestDaemon`] boots a real daemon kernel (context + message router) on
//! an ephemeral loopback port, with a static device inventory and the
//! loopback serial provider so no hardware is involved.

#![deny(unsafe_code)]
#![deny(clippy::all)]

use std::sync::Arc;

use fbuild_config::DaemonConfig;
use fbuild_core::{DeviceId, FbuildHome};
use fbuild_kernel::context::DaemonContext;
use fbuild_kernel::devices::{DeviceInfo, StaticEnumerator};
use fbuild_kernel::serial::LoopbackProvider;
use fbuild_kernel::server::{DaemonServer, ServerHandle};
use tempfile::TempDir;

/// A daemon kernel running in-process for tests.
pub struct TestDaemon {
    /// The daemon context (managers are reachable for assertions).
    pub context: Arc<DaemonContext>,
    /// Running server handle.
    pub handle: ServerHandle,
    /// `host:port` string for clients.
    pub addr: String,
    /// The loopback serial provider backing the serial manager.
    pub serial: LoopbackProvider,
    /// Keeps the daemon's data directory alive.
    _data_dir: TempDir,
}

/// The fixed test device inventory.
#[must_use]
pub fn test_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            device_id: DeviceId::new("usb-001"),
            port: "/dev/ttyUSB0".to_owned(),
            vid: Some(0x303a),
            pid: Some(0x1001),
            serial_number: Some("A1".to_owned()),
            description: "ESP32-S3".to_owned(),
        },
        DeviceInfo {
            device_id: DeviceId::new("usb-002"),
            port: "/dev/ttyACM0".to_owned(),
            vid: Some(0x2e8a),
            pid: Some(0x000a),
            serial_number: Some("B2".to_owned()),
            description: "RP2040".to_owned(),
        },
    ]
}

impl TestDaemon {
    /// Boot a daemon on an ephemeral port with default test config.
    ///
    /// # Panics
    ///
    /// Panics when the kernel cannot start; tests want a loud failure.
    pub async fn start() -> Self {
        Self::start_with(DaemonConfig::default()).await
    }

    /// Boot a daemon with a custom config (the port is forced ephemeral).
    ///
    /// # Panics
    ///
    /// Panics when the kernel cannot start.
    pub async fn start_with(mut config: DaemonConfig) -> Self {
        config.network.port = 0;
        config.network.unix_socket = false;

        let data_dir = TempDir::new().expect("failed to create temp dir");
        let serial = LoopbackProvider::new();
        let context = DaemonContext::new(
            FbuildHome::from_path(data_dir.path()),
            config,
            Box::new(StaticEnumerator::new(test_devices())),
            Arc::new(serial.clone()),
            None,
        )
        .expect("failed to build daemon context");

        let server = DaemonServer::new(Arc::clone(&context));
        let handle = server.serve().await.expect("failed to start server");
        let addr = handle.local_addr.to_string();

        Self {
            context,
            handle,
            addr,
            serial,
            _data_dir: data_dir,
        }
    }
}
