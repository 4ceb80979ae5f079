//! The daemon context: one construction, no ambient state.
//!
//! Every subsystem receives the context explicitly (by `Arc`). The
//! dev/prod data-directory switch is resolved once, when the
//! [`fbuild_core::FbuildHome`] passed in here was built.

use std::sync::Arc;
use std::time::Duration;

use fbuild_config::DaemonConfig;
use fbuild_core::FbuildHome;
use fbuild_events::EventBus;

use crate::devices::{DeviceEnumerator, DeviceLeaseManager};
use crate::error::{KernelError, KernelResult};
use crate::ledger::FirmwareLedger;
use crate::locks::ConfigurationLockManager;
use crate::procs::ProcessTracker;
use crate::registry::ClientRegistry;
use crate::serial::{SerialPortProvider, SharedSerialManager};
use crate::status::StatusManager;

/// The process-singleton wiring of all managers.
#[derive(Debug)]
pub struct DaemonContext {
    /// Daemon data directory.
    pub home: FbuildHome,
    /// Effective configuration.
    pub config: DaemonConfig,
    /// Event bus connecting managers to the router's broadcast fan-out.
    pub bus: EventBus,
    /// Status manager (C1).
    pub status: StatusManager,
    /// Client registry (C2).
    pub registry: ClientRegistry,
    /// Configuration lock manager (C3).
    pub locks: ConfigurationLockManager,
    /// Device lease manager (C4).
    pub devices: DeviceLeaseManager,
    /// Shared serial manager (C5).
    pub serial: SharedSerialManager,
    /// Firmware ledger (C6).
    pub ledger: FirmwareLedger,
    /// Child-process tracker.
    pub procs: ProcessTracker,
    /// This daemon's PID.
    pub daemon_pid: u32,
    /// PID of the spawning client, when provided.
    pub spawned_by: Option<u32>,
}

impl DaemonContext {
    /// Build the context over explicit providers.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::StateIo`] when the data directory cannot be
    /// created.
    pub fn new(
        home: FbuildHome,
        config: DaemonConfig,
        enumerator: Box<dyn DeviceEnumerator>,
        serial_provider: Arc<dyn SerialPortProvider>,
        spawned_by: Option<u32>,
    ) -> KernelResult<Arc<Self>> {
        home.ensure().map_err(|source| KernelError::StateIo {
            path: home.root().display().to_string(),
            source,
        })?;

        let bus = EventBus::new();
        let daemon_pid = std::process::id();
        let context = Self {
            status: StatusManager::new(home.status_file(), daemon_pid, spawned_by),
            registry: ClientRegistry::new(Duration::from_secs_f64(
                config.heartbeat.timeout_secs,
            )),
            locks: ConfigurationLockManager::new(config.locks.default_timeout_secs),
            devices: DeviceLeaseManager::new(enumerator),
            serial: SharedSerialManager::new(serial_provider, bus.clone(), config.serial.clone()),
            ledger: FirmwareLedger::load(home.ledger_file()),
            procs: ProcessTracker::load(home.process_registry_file()),
            bus,
            home,
            config,
            daemon_pid,
            spawned_by,
        };
        Ok(Arc::new(context))
    }

    /// Cascade cleanup for a departed client across every manager that may
    /// hold state for it. Safe to call for unknown clients.
    pub fn cleanup_client(&self, client_id: &fbuild_core::ClientId) {
        let released_locks = self.locks.release_all_client_locks(client_id);
        let released_leases = self.devices.release_all_client_leases(client_id);
        self.serial.disconnect_client(client_id);
        self.procs.forget_client(client_id);
        self.registry.unregister(client_id);
        if released_locks > 0 || released_leases > 0 {
            tracing::info!(
                %client_id,
                released_locks,
                released_leases,
                "cascade cleanup complete"
            );
        }
    }

    /// Refresh the client count and held-lock snapshot in the status file.
    pub fn refresh_status_runtime_info(&self) {
        self.status
            .update_runtime_info(self.registry.client_count(), self.locks.held_lock_statuses());
    }
}
