//! Configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::DaemonConfig;

/// Validate a merged configuration.
///
/// Field-level sanity plus the heartbeat interactions: four missed beats
/// must fit inside the timeout, and the dead-client sweep must not fire
/// faster than the timeout it enforces.
pub(crate) fn validate(config: &DaemonConfig) -> ConfigResult<()> {
    let hb = &config.heartbeat;
    if hb.send_interval_secs <= 0.0 || hb.timeout_secs <= 0.0 || hb.sweep_interval_secs <= 0.0 {
        return Err(ConfigError::Invalid(
            "heartbeat intervals must be positive".to_owned(),
        ));
    }
    if hb.send_interval_secs * 4.0 > hb.timeout_secs {
        return Err(ConfigError::Invalid(format!(
            "heartbeat send interval {}s is too slow for timeout {}s (need send * 4 <= timeout)",
            hb.send_interval_secs, hb.timeout_secs
        )));
    }
    if hb.sweep_interval_secs < hb.timeout_secs {
        return Err(ConfigError::Invalid(format!(
            "dead-client sweep interval {}s must be >= heartbeat timeout {}s",
            hb.sweep_interval_secs, hb.timeout_secs
        )));
    }

    if config.locks.default_timeout_secs < 0.0 {
        return Err(ConfigError::Invalid(
            "lock timeout must not be negative".to_owned(),
        ));
    }

    if config.serial.max_buffer_lines == 0 {
        return Err(ConfigError::Invalid(
            "serial buffer must hold at least one line".to_owned(),
        ));
    }

    let pl = &config.pipeline;
    if pl.download_workers == 0 || pl.unpack_workers == 0 || pl.install_workers == 0 {
        return Err(ConfigError::Invalid(
            "pipeline pools need at least one worker each".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        validate(&DaemonConfig::default()).unwrap();
    }

    #[test]
    fn test_slow_heartbeat_rejected() {
        let mut config = DaemonConfig::default();
        config.heartbeat.send_interval_secs = 2.0; // 2 * 4 > 4
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("send * 4 <= timeout"));
    }

    #[test]
    fn test_fast_sweep_rejected() {
        let mut config = DaemonConfig::default();
        config.heartbeat.sweep_interval_secs = 1.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut config = DaemonConfig::default();
        config.pipeline.unpack_workers = 0;
        assert!(validate(&config).is_err());
    }
}
