//! Firmware deployment ledger.
//!
//! Small write-through store keyed by port name, answering "is the
//! firmware on this device already current?" so redundant flashes are
//! skipped. Persisted as one JSON file, rewritten atomically on every
//! record and reloaded leniently at daemon start (a corrupt file logs a
//! warning and yields an empty ledger).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fsio::write_json_atomically;

/// One recorded deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Port the firmware was flashed to.
    pub port: String,
    /// Hash of the flashed image.
    pub firmware_hash: String,
    /// Hash of the source tree it was built from.
    pub source_hash: String,
    /// Hash of the build flags.
    pub build_flags_hash: String,
    /// Owning project path.
    pub project_dir: String,
    /// Environment name.
    pub environment: String,
    /// When the upload completed.
    pub upload_timestamp: DateTime<Utc>,
}

/// Result of a currency query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentQuery {
    /// True when a prior entry exists and both hashes match.
    pub is_current: bool,
    /// Convenience negation of `is_current`.
    pub needs_redeploy: bool,
    /// The prior entry, when one exists.
    pub prior_entry: Option<LedgerEntry>,
}

/// The ledger.
#[derive(Debug)]
pub struct FirmwareLedger {
    path: PathBuf,
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl FirmwareLedger {
    /// Load the ledger from `path`, tolerating a missing or corrupt file.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, LedgerEntry>>(&raw) {
                Ok(entries) => {
                    info!(count = entries.len(), "firmware ledger loaded");
                    entries
                },
                Err(e) => {
                    warn!(error = %e, path = %path.display(),
                        "corrupt firmware ledger, starting empty");
                    HashMap::new()
                },
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Record a deployment, overwriting any previous entry for the port,
    /// and write through to disk.
    #[allow(clippy::too_many_arguments)]
    pub fn record_deployment(
        &self,
        port: &str,
        firmware_hash: &str,
        source_hash: &str,
        project_dir: &str,
        environment: &str,
        build_flags_hash: &str,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            port: port.to_owned(),
            firmware_hash: firmware_hash.to_owned(),
            source_hash: source_hash.to_owned(),
            build_flags_hash: build_flags_hash.to_owned(),
            project_dir: project_dir.to_owned(),
            environment: environment.to_owned(),
            upload_timestamp: Utc::now(),
        };
        let snapshot = {
            let mut entries = self.entries.lock().expect("ledger mutex poisoned");
            entries.insert(port.to_owned(), entry.clone());
            entries.clone()
        };
        if let Err(e) = write_json_atomically(&self.path, &snapshot) {
            warn!(error = %e, "failed to persist firmware ledger");
        }
        debug!(port, firmware_hash, "deployment recorded");
        entry
    }

    /// The last recorded deployment for a port.
    #[must_use]
    pub fn get_deployment(&self, port: &str) -> Option<LedgerEntry> {
        self.entries
            .lock()
            .expect("ledger mutex poisoned")
            .get(port)
            .cloned()
    }

    /// Is the deployed firmware current for the given hashes?
    ///
    /// `is_current` iff a prior entry exists, its source hash matches, and
    /// (when a build-flags hash is supplied) the build-flags hash matches
    /// too.
    #[must_use]
    pub fn query(
        &self,
        port: &str,
        source_hash: &str,
        build_flags_hash: Option<&str>,
    ) -> DeploymentQuery {
        let prior = self.get_deployment(port);
        let is_current = prior.as_ref().is_some_and(|entry| {
            entry.source_hash == source_hash
                && build_flags_hash.is_none_or(|flags| entry.build_flags_hash == flags)
        });
        DeploymentQuery {
            is_current,
            needs_redeploy: !is_current,
            prior_entry: prior,
        }
    }

    /// Number of recorded ports.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().expect("ledger mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &std::path::Path) -> FirmwareLedger {
        FirmwareLedger::load(dir.join("ledger.json"))
    }

    #[test]
    fn test_record_then_query_current() {
        let tmp = tempfile::tempdir().unwrap();
        let led = ledger(tmp.path());
        led.record_deployment("/dev/ttyUSB0", "fw1", "src1", "/p", "esp32dev", "flags1");

        let q = led.query("/dev/ttyUSB0", "src1", Some("flags1"));
        assert!(q.is_current);
        assert!(!q.needs_redeploy);
        assert_eq!(q.prior_entry.unwrap().firmware_hash, "fw1");
    }

    #[test]
    fn test_changed_source_needs_redeploy() {
        let tmp = tempfile::tempdir().unwrap();
        let led = ledger(tmp.path());
        led.record_deployment("/dev/ttyUSB0", "fw1", "src1", "/p", "e", "flags1");
        led.record_deployment("/dev/ttyUSB0", "fw2", "src2", "/p", "e", "flags1");

        // New record overwrote the old one.
        let q = led.query("/dev/ttyUSB0", "src1", None);
        assert!(!q.is_current);
        assert!(q.needs_redeploy);
        assert!(led.query("/dev/ttyUSB0", "src2", None).is_current);
        assert_eq!(led.entry_count(), 1);
    }

    #[test]
    fn test_build_flags_mismatch_not_current() {
        let tmp = tempfile::tempdir().unwrap();
        let led = ledger(tmp.path());
        led.record_deployment("/dev/ttyUSB0", "fw1", "src1", "/p", "e", "flags1");
        assert!(!led.query("/dev/ttyUSB0", "src1", Some("flags2")).is_current);
        // Without a flags hash only the source hash is compared.
        assert!(led.query("/dev/ttyUSB0", "src1", None).is_current);
    }

    #[test]
    fn test_unknown_port_needs_redeploy() {
        let tmp = tempfile::tempdir().unwrap();
        let led = ledger(tmp.path());
        let q = led.query("/dev/ttyACM9", "src", None);
        assert!(!q.is_current);
        assert!(q.prior_entry.is_none());
    }

    #[test]
    fn test_reload_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let led = ledger(tmp.path());
            led.record_deployment("/dev/ttyUSB0", "fw1", "src1", "/p", "e", "f");
        }
        let reloaded = ledger(tmp.path());
        assert_eq!(reloaded.entry_count(), 1);
        assert!(reloaded.query("/dev/ttyUSB0", "src1", None).is_current);
    }

    #[test]
    fn test_corrupt_file_yields_empty_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ledger.json"), b"{not json").unwrap();
        let led = ledger(tmp.path());
        assert_eq!(led.entry_count(), 0);
    }
}
