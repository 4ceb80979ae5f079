//! PID file management.
//!
//! The PID file is advisory-locked for the daemon's lifetime. A previous
//! daemon that died without cleanup leaves a stale file whose lock is
//! gone; acquisition simply takes the lock and overwrites the contents.
//! A second daemon finds the lock held and reports who owns it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::{KernelError, KernelResult};

/// Holds the locked PID file; dropping releases the lock and removes the
/// file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Acquire the PID file for this process.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AlreadyRunning`] when another live daemon
    /// holds the lock, or [`KernelError::StateIo`] on I/O failure.
    pub fn acquire(path: PathBuf) -> KernelResult<Self> {
        let state_err = |source| KernelError::StateIo {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(state_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(state_err)?;

        if file.try_lock_exclusive().is_err() {
            let mut contents = String::new();
            let _ = file.read_to_string(&mut contents);
            let pid = contents.trim().parse::<u32>().unwrap_or(0);
            info!(pid, "daemon already running");
            return Err(KernelError::AlreadyRunning { pid });
        }

        // Stale content from a daemon that died uncleanly is simply
        // overwritten now that we own the lock.
        let had_content = file
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if had_content {
            debug!(path = %path.display(), "overwriting stale pid file");
        }
        file.set_len(0).map_err(state_err)?;
        file.seek(SeekFrom::Start(0)).map_err(state_err)?;
        writeln!(file, "{}", std::process::id()).map_err(state_err)?;
        file.flush().map_err(state_err)?;

        Ok(Self { path, file })
    }

    /// The PID file path.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to unlock pid file");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, path = %self.path.display(), "failed to remove pid file");
        }
    }
}
