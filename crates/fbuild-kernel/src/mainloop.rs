//! Main loop: file-based request channels and housekeeping.
//!
//! Polls the four operation channels, services the device request/response
//! file pairs, and drives the periodic sweeps: orphaned processes, dead
//! clients, stale locks, aged cancel signals. Also owns the shutdown
//! policy: signal files and interrupts are honored only while no
//! operation is in progress, and a daemon with no clients and no work
//! self-evicts after a short continuous window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use fbuild_core::{ClientId, DeviceId};
use fbuild_events::DaemonEvent;

use crate::context::DaemonContext;
use crate::fsio::write_json_atomically;
use crate::requests::{
    BuildRequest, ChannelKind, DeployRequest, DeviceChannel, InstallDepsRequest, MonitorRequest,
    RequestChannel,
};
use crate::status::DaemonState;

/// Why the main loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A shutdown signal file was consumed.
    ShutdownSignal,
    /// No clients and no operations for the eviction window.
    SelfEviction,
    /// No request arrived within the idle timeout.
    IdleTimeout,
    /// SIGTERM/SIGINT outside an active operation.
    Interrupted,
}

/// The build/deploy/monitor/install collaborators behind the channels.
///
/// The daemon core stops at this interface: compile and link invocation,
/// flashing, and sketch preprocessing live outside the kernel.
pub trait OperationProcessor: Send + Sync {
    /// Process a build request.
    fn process_build(&self, request: &BuildRequest, context: &DaemonContext);
    /// Process a deploy request.
    fn process_deploy(&self, request: &DeployRequest, context: &DaemonContext);
    /// Process a monitor request.
    fn process_monitor(&self, request: &MonitorRequest, context: &DaemonContext);
    /// Process an install-dependencies request.
    fn process_install_deps(&self, request: &InstallDepsRequest, context: &DaemonContext);
}

/// Processor that only logs; used when no toolchain collaborators are
/// wired in (and by tests exercising loop mechanics).
#[derive(Debug, Default)]
pub struct LoggingProcessor;

impl OperationProcessor for LoggingProcessor {
    fn process_build(&self, request: &BuildRequest, _context: &DaemonContext) {
        info!(project = %request.project_dir, env = %request.environment, "build requested (no toolchain wired)");
    }

    fn process_deploy(&self, request: &DeployRequest, _context: &DaemonContext) {
        info!(project = %request.project_dir, port = %request.port, "deploy requested (no toolchain wired)");
    }

    fn process_monitor(&self, request: &MonitorRequest, _context: &DaemonContext) {
        info!(port = %request.port, baud = request.baud_rate, "monitor requested (no toolchain wired)");
    }

    fn process_install_deps(&self, request: &InstallDepsRequest, _context: &DaemonContext) {
        info!(project = %request.project_dir, "install-deps requested (no resolver wired)");
    }
}

/// Handle for the signal task: requests an interrupt check on the next
/// tick.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an interrupt as pending.
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

struct Timers {
    last_activity: Instant,
    last_orphan_sweep: Instant,
    last_stale_lock_sweep: Instant,
    last_dead_client_sweep: Instant,
    last_cancel_sweep: Instant,
    empty_since: Option<Instant>,
}

/// The main loop.
pub struct MainLoop {
    context: Arc<DaemonContext>,
    processor: Arc<dyn OperationProcessor>,
    interrupt: InterruptFlag,
    build: RequestChannel,
    deploy: RequestChannel,
    monitor: RequestChannel,
    install_deps: RequestChannel,
    device_channels: Vec<(DeviceChannel, RequestChannel)>,
}

impl MainLoop {
    /// Create the loop over a context and its operation collaborators.
    #[must_use]
    pub fn new(
        context: Arc<DaemonContext>,
        processor: Arc<dyn OperationProcessor>,
        interrupt: InterruptFlag,
    ) -> Self {
        let dir = context.home.requests_dir();
        let channel = |kind: ChannelKind| RequestChannel::new(dir.join(kind.file_name()));
        let device_channels = DeviceChannel::ALL
            .into_iter()
            .map(|ch| (ch, RequestChannel::new(dir.join(ch.request_file()))))
            .collect();
        Self {
            build: channel(ChannelKind::Build),
            deploy: channel(ChannelKind::Deploy),
            monitor: channel(ChannelKind::Monitor),
            install_deps: channel(ChannelKind::InstallDeps),
            device_channels,
            context,
            processor,
            interrupt,
        }
    }

    /// Run until an exit condition fires.
    pub async fn run(&self) -> ExitReason {
        let config = &self.context.config;
        let poll_sleep = Duration::from_millis(config.sweeps.poll_sleep_ms);
        let now = Instant::now();
        let mut timers = Timers {
            last_activity: now,
            last_orphan_sweep: now,
            last_stale_lock_sweep: now,
            last_dead_client_sweep: now,
            last_cancel_sweep: now,
            empty_since: None,
        };

        info!("entering main daemon loop");
        self.context
            .status
            .update_status(DaemonState::Idle, "Daemon ready");

        loop {
            if let Some(reason) = self.check_exit_conditions(&mut timers) {
                return reason;
            }
            self.run_sweeps(&mut timers);
            self.poll_operation_channels(&mut timers).await;
            self.poll_device_channels();
            tokio::time::sleep(poll_sleep).await;
        }
    }

    fn check_exit_conditions(&self, timers: &mut Timers) -> Option<ExitReason> {
        let config = &self.context.config;
        let operation_running = self.context.status.operation_in_progress();

        // Shutdown signal file: honored only while idle; left in place so
        // it is re-checked once the operation finishes.
        let shutdown_file = self.context.home.shutdown_signal();
        if shutdown_file.exists() {
            if operation_running {
                warn!("shutdown signal received during active operation, deferring");
            } else {
                let _ = std::fs::remove_file(&shutdown_file);
                info!("shutdown requested via signal file");
                return Some(ExitReason::ShutdownSignal);
            }
        }

        // SIGTERM/SIGINT: refused during an active operation.
        if self.interrupt.take() {
            if operation_running {
                warn!("interrupt received during active operation, refusing to exit");
            } else {
                info!("interrupted outside active operation, shutting down");
                return Some(ExitReason::Interrupted);
            }
        }

        // Idle timeout.
        if timers.last_activity.elapsed().as_secs_f64() > config.sweeps.idle_timeout_secs {
            info!(
                idle_secs = timers.last_activity.elapsed().as_secs_f64(),
                "idle timeout reached"
            );
            return Some(ExitReason::IdleTimeout);
        }

        // Self-eviction: continuously empty for the eviction window.
        let empty = self.context.registry.client_count() == 0 && !operation_running;
        if empty {
            let since = *timers.empty_since.get_or_insert_with(Instant::now);
            if since.elapsed().as_secs_f64() >= config.sweeps.self_eviction_secs {
                info!(
                    empty_secs = since.elapsed().as_secs_f64(),
                    "self-eviction: no clients and no operations"
                );
                return Some(ExitReason::SelfEviction);
            }
        } else if timers.empty_since.take().is_some() {
            debug!("daemon no longer empty, eviction timer reset");
        }

        None
    }

    fn run_sweeps(&self, timers: &mut Timers) {
        let config = &self.context.config;

        if timers.last_orphan_sweep.elapsed().as_secs_f64() >= config.sweeps.orphan_interval_secs {
            timers.last_orphan_sweep = Instant::now();
            let orphaned = self.context.procs.cleanup_orphans();
            if !orphaned.is_empty() {
                info!(count = orphaned.len(), "cleaned up orphaned child processes");
            }
        }

        if timers.last_dead_client_sweep.elapsed().as_secs_f64()
            >= config.heartbeat.sweep_interval_secs
        {
            timers.last_dead_client_sweep = Instant::now();
            for client_id in self.context.registry.cleanup_dead_clients() {
                self.cascade_dead_client(&client_id);
            }
        }

        // Manual stale-lock sweep signal.
        let clear_signal = self.context.home.clear_stale_locks_signal();
        if clear_signal.exists() {
            let _ = std::fs::remove_file(&clear_signal);
            info!("manual stale-lock sweep requested");
            self.sweep_stale_locks();
        }

        if timers.last_stale_lock_sweep.elapsed().as_secs_f64()
            >= config.sweeps.stale_lock_interval_secs
        {
            timers.last_stale_lock_sweep = Instant::now();
            self.sweep_stale_locks();
            self.context
                .locks
                .cleanup_unused_locks(config.locks.gc_age_secs);
        }

        if timers.last_cancel_sweep.elapsed().as_secs_f64() >= 60.0 {
            timers.last_cancel_sweep = Instant::now();
            self.sweep_stale_cancel_signals();
        }
    }

    fn cascade_dead_client(&self, client_id: &ClientId) {
        warn!(%client_id, "dead client detected by sweep");
        // The registry entry is already gone; release everything else.
        self.context.locks.release_all_client_locks(client_id);
        self.context.devices.release_all_client_leases(client_id);
        self.context.serial.disconnect_client(client_id);
        self.context.procs.forget_client(client_id);
        self.context.bus.publish(DaemonEvent::ClientDisconnected {
            client_id: client_id.clone(),
            reason: "Dead client sweep".to_owned(),
        });
        self.context.refresh_status_runtime_info();
    }

    fn sweep_stale_locks(&self) {
        let stale = self.context.locks.stale_locks();
        if stale.is_empty() {
            return;
        }
        warn!(count = stale.len(), "force-releasing stale locks");
        let released = self.context.locks.force_release_stale_locks();
        self.context
            .bus
            .publish(DaemonEvent::StaleLocksReleased { count: released });
        self.context.refresh_status_runtime_info();
    }

    /// Remove `cancel_*.signal` files older than the configured age.
    fn sweep_stale_cancel_signals(&self) {
        let max_age =
            Duration::from_secs_f64(self.context.config.sweeps.cancel_signal_max_age_secs);
        let Ok(entries) = std::fs::read_dir(self.context.home.root()) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("cancel_") || !name.ends_with(".signal") {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                debug!(file = %name, "swept stale cancel signal");
            }
        }
    }

    async fn poll_operation_channels(&self, timers: &mut Timers) {
        if let Some(request) = self.build.poll::<BuildRequest>() {
            timers.last_activity = Instant::now();
            info!(project = %request.project_dir, env = %request.environment, "build request received");
            self.run_operation(DaemonState::Building, "Building", move |processor, context| {
                processor.process_build(&request, context);
            })
            .await;
        }

        if let Some(request) = self.deploy.poll::<DeployRequest>() {
            timers.last_activity = Instant::now();
            info!(project = %request.project_dir, port = %request.port, "deploy request received");
            self.run_operation(DaemonState::Deploying, "Deploying", move |processor, context| {
                processor.process_deploy(&request, context);
            })
            .await;
        }

        if let Some(request) = self.monitor.poll::<MonitorRequest>() {
            timers.last_activity = Instant::now();
            info!(port = %request.port, "monitor request received");
            self.run_operation(DaemonState::Monitoring, "Monitoring", move |processor, context| {
                processor.process_monitor(&request, context);
            })
            .await;
        }

        if let Some(request) = self.install_deps.poll::<InstallDepsRequest>() {
            timers.last_activity = Instant::now();
            info!(project = %request.project_dir, "install-deps request received");
            self.run_operation(
                DaemonState::Installing,
                "Installing dependencies",
                move |processor, context| {
                    processor.process_install_deps(&request, context);
                },
            )
            .await;
        }
    }

    /// Run one operation with the in-progress flag held, off the reactor.
    async fn run_operation<F>(&self, state: DaemonState, message: &str, op: F)
    where
        F: FnOnce(&dyn OperationProcessor, &DaemonContext) + Send + 'static,
    {
        self.context.status.set_operation_in_progress(true);
        self.context.status.update_status(state, message);

        let processor = Arc::clone(&self.processor);
        let context = Arc::clone(&self.context);
        let result =
            tokio::task::spawn_blocking(move || op(processor.as_ref(), context.as_ref())).await;
        if let Err(e) = result {
            error!(error = %e, "operation processor panicked");
        }

        self.context.status.update_status(DaemonState::Idle, "Idle");
        self.context.status.set_operation_in_progress(false);
    }

    fn poll_device_channels(&self) {
        for (kind, channel) in &self.device_channels {
            let Some(request) = channel.poll::<Value>() else {
                continue;
            };
            let response = self.process_device_request(*kind, &request);
            let response_path = self
                .context
                .home
                .requests_dir()
                .join(kind.response_file());
            if let Err(e) = write_json_atomically(&response_path, &response) {
                error!(error = %e, "failed to write device response");
            }
        }
    }

    fn process_device_request(&self, kind: DeviceChannel, request: &Value) -> Value {
        let devices = &self.context.devices;
        let client_id = request
            .get("client_id")
            .and_then(Value::as_str)
            .map(ClientId::new)
            .unwrap_or_else(|| ClientId::new("file-channel"));

        match kind {
            DeviceChannel::List => {
                let include_disconnected = request
                    .get("include_disconnected")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if request.get("refresh").and_then(Value::as_bool).unwrap_or(false) {
                    devices.refresh_devices();
                }
                let listed = devices.list_devices(include_disconnected);
                json!({
                    "success": true,
                    "total_devices": listed.len(),
                    "total_leases": devices.lease_count(),
                    "devices": listed,
                })
            },
            DeviceChannel::Status => match request.get("device_id").and_then(Value::as_str) {
                Some(device_id) => devices.device_status(&DeviceId::new(device_id)),
                None => json!({ "success": false, "message": "device_id is required" }),
            },
            DeviceChannel::Lease => {
                let Some(device_id) = request.get("device_id").and_then(Value::as_str) else {
                    return json!({ "success": false, "message": "device_id is required" });
                };
                let description = request
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let allows_monitors = request
                    .get("allows_monitors")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                // File-channel leases never block the loop.
                let lease = match request.get("lease_type").and_then(Value::as_str) {
                    Some("monitor") => {
                        devices.acquire_monitor(&DeviceId::new(device_id), &client_id, description)
                    },
                    _ => devices.acquire_exclusive(
                        &DeviceId::new(device_id),
                        &client_id,
                        description,
                        allows_monitors,
                        0.0,
                    ),
                };
                match lease {
                    Some(lease) => json!({
                        "success": true,
                        "lease_id": lease.lease_id,
                        "lease_type": lease.lease_type.as_str(),
                        "device_id": lease.device_id,
                    }),
                    None => json!({ "success": false, "message": "Lease not available" }),
                }
            },
            DeviceChannel::Release => match request.get("lease_id").and_then(Value::as_str) {
                Some(lease_id) => {
                    let released =
                        devices.release_lease(&fbuild_core::LeaseId::new(lease_id), &client_id);
                    json!({ "success": released })
                },
                None => json!({ "success": false, "message": "lease_id is required" }),
            },
            DeviceChannel::Preempt => {
                let Some(device_id) = request.get("device_id").and_then(Value::as_str) else {
                    return json!({ "success": false, "message": "device_id is required" });
                };
                let reason = request
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if reason.trim().is_empty() {
                    return json!({
                        "success": false,
                        "message": "reason is required and must not be empty",
                    });
                }
                match devices.preempt_device(&DeviceId::new(device_id), &client_id, reason) {
                    Some((lease, preempted)) => {
                        self.context.bus.publish(DaemonEvent::DevicePreempted {
                            device_id: DeviceId::new(device_id),
                            preempted_by: client_id,
                            preempted_client_id: preempted.clone(),
                            reason: reason.to_owned(),
                        });
                        json!({
                            "success": true,
                            "lease_id": lease.lease_id,
                            "preempted_client_id": preempted,
                        })
                    },
                    None => json!({ "success": false, "message": "device not found" }),
                }
            },
        }
    }

    /// Request channel for tests and embedded callers.
    #[must_use]
    pub fn channel(&self, kind: ChannelKind) -> &RequestChannel {
        match kind {
            ChannelKind::Build => &self.build,
            ChannelKind::Deploy => &self.deploy,
            ChannelKind::Monitor => &self.monitor,
            ChannelKind::InstallDeps => &self.install_deps,
        }
    }
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoop").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::StaticEnumerator;
    use crate::serial::LoopbackProvider;
    use fbuild_config::DaemonConfig;
    use fbuild_core::FbuildHome;
    use std::sync::Mutex;

    fn fast_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.sweeps.poll_sleep_ms = 20;
        config.sweeps.self_eviction_secs = 0.3;
        config
    }

    fn test_loop(dir: &std::path::Path, config: DaemonConfig) -> MainLoop {
        let context = DaemonContext::new(
            FbuildHome::from_path(dir),
            config,
            Box::new(StaticEnumerator::new(Vec::new())),
            Arc::new(LoopbackProvider::new()),
            None,
        )
        .unwrap();
        MainLoop::new(context, Arc::new(LoggingProcessor), InterruptFlag::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_self_eviction_when_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let main_loop = test_loop(tmp.path(), fast_config());
        let started = Instant::now();
        let reason = main_loop.run().await;
        assert_eq!(reason, ExitReason::SelfEviction);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "exited too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "exited too late: {elapsed:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_presence_blocks_self_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let main_loop = test_loop(tmp.path(), fast_config());
        main_loop.context.registry.register(
            ClientId::new("c1"),
            crate::registry::ClientMetadata {
                pid: std::process::id(),
                ..Default::default()
            },
        );
        // Shut down via the signal file instead; eviction must not fire.
        let shutdown_file = main_loop.context.home.shutdown_signal();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            std::fs::write(&shutdown_file, b"").unwrap();
        });
        let reason = main_loop.run().await;
        handle.await.unwrap();
        assert_eq!(reason, ExitReason::ShutdownSignal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interrupt_refused_during_operation() {
        let tmp = tempfile::tempdir().unwrap();
        let main_loop = test_loop(tmp.path(), fast_config());
        main_loop.context.status.set_operation_in_progress(true);
        main_loop.interrupt.raise();

        // Keep a client registered so self-eviction cannot end the test.
        main_loop.context.registry.register(
            ClientId::new("c1"),
            crate::registry::ClientMetadata {
                pid: std::process::id(),
                ..Default::default()
            },
        );

        let run = main_loop.run();
        tokio::pin!(run);
        // The loop must still be running after several ticks.
        let outcome = tokio::time::timeout(Duration::from_millis(300), &mut run).await;
        assert!(outcome.is_err(), "loop exited despite active operation");

        // Once the operation ends, a second interrupt exits cleanly.
        main_loop.context.status.set_operation_in_progress(false);
        main_loop.interrupt.raise();
        let reason = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::Interrupted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_build_channel_processed_once() {
        struct CountingProcessor {
            builds: Mutex<Vec<String>>,
        }
        impl OperationProcessor for CountingProcessor {
            fn process_build(&self, request: &BuildRequest, _context: &DaemonContext) {
                self.builds.lock().unwrap().push(request.project_dir.clone());
            }
            fn process_deploy(&self, _: &DeployRequest, _: &DaemonContext) {}
            fn process_monitor(&self, _: &MonitorRequest, _: &DaemonContext) {}
            fn process_install_deps(&self, _: &InstallDepsRequest, _: &DaemonContext) {}
        }

        let tmp = tempfile::tempdir().unwrap();
        let context = DaemonContext::new(
            FbuildHome::from_path(tmp.path()),
            fast_config(),
            Box::new(StaticEnumerator::new(Vec::new())),
            Arc::new(LoopbackProvider::new()),
            None,
        )
        .unwrap();
        let processor = Arc::new(CountingProcessor {
            builds: Mutex::new(Vec::new()),
        });
        let main_loop = MainLoop::new(
            Arc::clone(&context),
            Arc::clone(&processor) as Arc<dyn OperationProcessor>,
            InterruptFlag::new(),
        );

        main_loop
            .channel(ChannelKind::Build)
            .publish(&BuildRequest {
                project_dir: "/blinky".into(),
                environment: "uno".into(),
                verbose: false,
                clean: false,
                operation_id: None,
            })
            .unwrap();

        // The loop self-evicts shortly after processing (no clients).
        let reason = tokio::time::timeout(Duration::from_secs(5), main_loop.run())
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::SelfEviction);
        assert_eq!(*processor.builds.lock().unwrap(), vec!["/blinky".to_owned()]);
        // The request file was consumed.
        assert!(!main_loop.channel(ChannelKind::Build).path().exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_cancel_signals_swept() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.sweeps.cancel_signal_max_age_secs = 0.0;
        let main_loop = test_loop(tmp.path(), config);

        let fresh = main_loop.context.home.cancel_signal("op-1");
        std::fs::write(&fresh, b"").unwrap();
        std::thread::sleep(Duration::from_millis(10));

        main_loop.sweep_stale_cancel_signals();
        assert!(!fresh.exists());
    }

    #[test]
    fn test_device_channel_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let context = DaemonContext::new(
            FbuildHome::from_path(tmp.path()),
            fast_config(),
            Box::new(StaticEnumerator::new(vec![crate::devices::DeviceInfo {
                device_id: DeviceId::new("usb-001"),
                port: "/dev/ttyUSB0".into(),
                vid: Some(1),
                pid: Some(2),
                serial_number: Some("SN".into()),
                description: "board".into(),
            }])),
            Arc::new(LoopbackProvider::new()),
            None,
        )
        .unwrap();
        let main_loop = MainLoop::new(context, Arc::new(LoggingProcessor), InterruptFlag::new());

        let response = main_loop.process_device_request(
            DeviceChannel::Lease,
            &json!({ "device_id": "usb-001", "client_id": "file-cli" }),
        );
        assert_eq!(response["success"], true);
        let lease_id = response["lease_id"].as_str().unwrap().to_owned();

        // Preempt with an empty reason is refused.
        let response = main_loop.process_device_request(
            DeviceChannel::Preempt,
            &json!({ "device_id": "usb-001", "reason": "  " }),
        );
        assert_eq!(response["success"], false);

        let response = main_loop.process_device_request(
            DeviceChannel::Release,
            &json!({ "lease_id": lease_id, "client_id": "file-cli" }),
        );
        assert_eq!(response["success"], true);
    }
}
