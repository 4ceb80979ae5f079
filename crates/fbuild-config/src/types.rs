//! Configuration structs with serde defaults.

use serde::{Deserialize, Serialize};

/// Root daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Network binding.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Heartbeat timing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Housekeeping sweep intervals.
    #[serde(default)]
    pub sweeps: SweepConfig,
    /// Configuration-lock policy.
    #[serde(default)]
    pub locks: LockConfig,
    /// Serial session policy.
    #[serde(default)]
    pub serial: SerialConfig,
    /// Package pipeline pool sizing.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Network binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// TCP bind host; the daemon trusts the transport, keep it on loopback.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Also listen on a Unix-domain socket (Unix targets only).
    #[serde(default = "default_true")]
    pub unix_socket: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            unix_socket: true,
        }
    }
}

/// Heartbeat timing.
///
/// The send cadence is what clients are told to do; the timeout is what the
/// server enforces. Validation requires `send_interval_secs * 4 <=
/// timeout_secs` and `sweep_interval_secs >= timeout_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Client send cadence, seconds.
    #[serde(default = "default_heartbeat_send")]
    pub send_interval_secs: f64,
    /// Server-side liveness timeout, seconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: f64,
    /// Dead-client sweep interval, seconds.
    #[serde(default = "default_dead_client_sweep")]
    pub sweep_interval_secs: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            send_interval_secs: default_heartbeat_send(),
            timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_dead_client_sweep(),
        }
    }
}

/// Housekeeping sweep intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// Orphaned-process sweep, seconds.
    #[serde(default = "default_orphan_sweep")]
    pub orphan_interval_secs: f64,
    /// Stale-lock sweep, seconds.
    #[serde(default = "default_stale_lock_sweep")]
    pub stale_lock_interval_secs: f64,
    /// Maximum age of a cancel-signal file before it is swept, seconds.
    #[serde(default = "default_cancel_signal_max_age")]
    pub cancel_signal_max_age_secs: f64,
    /// Main loop poll sleep, milliseconds.
    #[serde(default = "default_poll_sleep_ms")]
    pub poll_sleep_ms: u64,
    /// Continuous empty window before self-eviction, seconds.
    #[serde(default = "default_self_eviction")]
    pub self_eviction_secs: f64,
    /// Idle timeout before the daemon exits, seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            orphan_interval_secs: default_orphan_sweep(),
            stale_lock_interval_secs: default_stale_lock_sweep(),
            cancel_signal_max_age_secs: default_cancel_signal_max_age(),
            poll_sleep_ms: default_poll_sleep_ms(),
            self_eviction_secs: default_self_eviction(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Configuration-lock policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Default staleness timeout for held locks, seconds.
    #[serde(default = "default_lock_timeout")]
    pub default_timeout_secs: f64,
    /// Age after which unheld lock entries are garbage-collected, seconds.
    #[serde(default = "default_lock_gc_age")]
    pub gc_age_secs: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_lock_timeout(),
            gc_age_secs: default_lock_gc_age(),
        }
    }
}

/// Serial session policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Bound on buffered complete lines per session; oldest drop first.
    #[serde(default = "default_serial_buffer_lines")]
    pub max_buffer_lines: usize,
    /// Default writer-acquisition timeout, seconds.
    #[serde(default = "default_writer_timeout")]
    pub writer_timeout_secs: f64,
    /// Close the port when the last reader detaches.
    #[serde(default = "default_true")]
    pub close_on_last_reader: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            max_buffer_lines: default_serial_buffer_lines(),
            writer_timeout_secs: default_writer_timeout(),
            close_on_last_reader: true,
        }
    }
}

/// Package pipeline pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Concurrent downloads.
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    /// Concurrent extractions.
    #[serde(default = "default_cpu_workers")]
    pub unpack_workers: usize,
    /// Concurrent install/verification jobs.
    #[serde(default = "default_cpu_workers")]
    pub install_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_workers: default_download_workers(),
            unpack_workers: default_cpu_workers(),
            install_workers: default_cpu_workers(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    9876
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_send() -> f64 {
    1.0
}

fn default_heartbeat_timeout() -> f64 {
    4.0
}

fn default_dead_client_sweep() -> f64 {
    10.0
}

fn default_orphan_sweep() -> f64 {
    5.0
}

fn default_stale_lock_sweep() -> f64 {
    60.0
}

fn default_cancel_signal_max_age() -> f64 {
    300.0
}

fn default_poll_sleep_ms() -> u64 {
    500
}

fn default_self_eviction() -> f64 {
    4.0
}

fn default_idle_timeout() -> f64 {
    12.0 * 3600.0
}

fn default_lock_timeout() -> f64 {
    1800.0
}

fn default_lock_gc_age() -> f64 {
    3600.0
}

fn default_serial_buffer_lines() -> usize {
    2000
}

fn default_writer_timeout() -> f64 {
    5.0
}

fn default_download_workers() -> usize {
    num_cpus::get().min(4)
}

fn default_cpu_workers() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.port, 9876);
        assert!((config.heartbeat.timeout_secs - 4.0).abs() < f64::EPSILON);
        assert_eq!(config.serial.max_buffer_lines, 2000);
        assert!(config.pipeline.download_workers <= 4);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DaemonConfig =
            toml::from_str("[network]\nport = 7777\n").unwrap();
        assert_eq!(config.network.port, 7777);
        assert_eq!(config.network.host, "127.0.0.1");
        assert!((config.locks.default_timeout_secs - 1800.0).abs() < f64::EPSILON);
    }
}
