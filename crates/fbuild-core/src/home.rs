//! Directory scaffolding for the daemon's on-disk state.
//!
//! [`FbuildHome`] owns the daemon data tree. In normal operation it lives
//! under the user home directory; setting `FBUILD_DEV_MODE=1` switches to a
//! project-local tree so development daemons never collide with a real one.
//!
//! # Layout
//!
//! ```text
//! ~/.fbuild/daemon/               (FbuildHome, prod)
//! ├── logs/                         (daily-rotated daemon logs)
//! ├── requests/                     (file-based request channels)
//! ├── packages/                     (package cache: toolchains/, platforms/, ...)
//! ├── status.json                   (atomically rewritten status snapshot)
//! ├── firmware_ledger.json          (port -> last deployment record)
//! ├── processes.json                (per-client child-process registry)
//! └── fbuild-daemon.pid             (PID file, advisory-locked)
//!
//! <project>/.fbuild/daemon_dev/   (FbuildHome, FBUILD_DEV_MODE=1)
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// Environment variable selecting the project-local development tree.
pub const DEV_MODE_ENV: &str = "FBUILD_DEV_MODE";

/// Root of the daemon's on-disk state.
#[derive(Debug, Clone)]
pub struct FbuildHome {
    root: PathBuf,
}

impl FbuildHome {
    /// Resolve the daemon home directory.
    ///
    /// When `FBUILD_DEV_MODE=1`, resolves to `<cwd>/.fbuild/daemon_dev/`.
    /// Otherwise resolves to `$HOME/.fbuild/daemon/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relevant base directory cannot be determined
    /// (no `$HOME` outside dev mode, no current directory inside it).
    pub fn resolve() -> io::Result<Self> {
        let dev_mode = std::env::var(DEV_MODE_ENV).is_ok_and(|v| v == "1");
        let root = if dev_mode {
            std::env::current_dir()?.join(".fbuild").join("daemon_dev")
        } else {
            let home = std::env::var("HOME").map_err(|_| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "HOME environment variable is not set",
                )
            })?;
            PathBuf::from(home).join(".fbuild").join("daemon")
        };
        Ok(Self { root })
    }

    /// Create from an explicit path (used by tests and `--data-dir`).
    #[must_use]
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the directory tree exists.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.requests_dir())?;
        std::fs::create_dir_all(self.packages_dir())?;
        Ok(())
    }

    /// Root directory path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Log directory (`<root>/logs/`).
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Request channel directory (`<root>/requests/`).
    #[must_use]
    pub fn requests_dir(&self) -> PathBuf {
        self.root.join("requests")
    }

    /// Package cache root (`<root>/packages/`).
    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Toolchain cache slot (`<root>/packages/toolchains/<hash>/<version>/`).
    #[must_use]
    pub fn toolchain_dir(&self, content_hash: &str, version: &str) -> PathBuf {
        self.packages_dir()
            .join("toolchains")
            .join(content_hash)
            .join(version)
    }

    /// Platform-core cache slot (`<root>/packages/platforms/<hash>/<version>/`).
    #[must_use]
    pub fn platform_dir(&self, content_hash: &str, version: &str) -> PathBuf {
        self.packages_dir()
            .join("platforms")
            .join(content_hash)
            .join(version)
    }

    /// Framework cache slot (`<root>/packages/frameworks/<hash>/<version>/`).
    #[must_use]
    pub fn framework_dir(&self, content_hash: &str, version: &str) -> PathBuf {
        self.packages_dir()
            .join("frameworks")
            .join(content_hash)
            .join(version)
    }

    /// Status snapshot file.
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Firmware ledger file.
    #[must_use]
    pub fn ledger_file(&self) -> PathBuf {
        self.root.join("firmware_ledger.json")
    }

    /// Child-process registry file.
    #[must_use]
    pub fn process_registry_file(&self) -> PathBuf {
        self.root.join("processes.json")
    }

    /// PID file.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("fbuild-daemon.pid")
    }

    /// Unix socket path (Unix targets only; TCP is always available).
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    /// Shutdown signal file.
    #[must_use]
    pub fn shutdown_signal(&self) -> PathBuf {
        self.root.join("shutdown.signal")
    }

    /// Manual stale-lock sweep signal file.
    #[must_use]
    pub fn clear_stale_locks_signal(&self) -> PathBuf {
        self.root.join("clear_stale_locks.signal")
    }

    /// Cancel signal file for a specific operation.
    #[must_use]
    pub fn cancel_signal(&self, operation_id: &str) -> PathBuf {
        self.root.join(format!("cancel_{operation_id}.signal"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let home = FbuildHome::from_path(tmp.path());
        assert_eq!(home.root(), tmp.path());
        assert_eq!(home.status_file(), tmp.path().join("status.json"));
        assert_eq!(
            home.cancel_signal("op-7"),
            tmp.path().join("cancel_op-7.signal")
        );
    }

    #[test]
    fn test_package_cache_layout() {
        let home = FbuildHome::from_path("/data");
        assert_eq!(
            home.toolchain_dir("ab12", "7.3.0"),
            PathBuf::from("/data/packages/toolchains/ab12/7.3.0")
        );
        assert_eq!(
            home.platform_dir("cd34", "2.0.1"),
            PathBuf::from("/data/packages/platforms/cd34/2.0.1")
        );
    }

    #[test]
    fn test_ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let home = FbuildHome::from_path(tmp.path().join("daemon"));
        home.ensure().unwrap();
        assert!(home.logs_dir().is_dir());
        assert!(home.requests_dir().is_dir());
        assert!(home.packages_dir().is_dir());
    }
}
