//! Kernel error types.

use thiserror::Error;

/// Errors surfaced by kernel subsystems.
///
/// Manager operations the protocol defines as boolean RPCs (lock
/// acquisition, lease grants, writer slots) do not error; they return
/// `false`/`None` and the caller retries or reports. These variants cover
/// genuine failures: I/O on persisted state, invariant violations, and a
/// daemon that is already running.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Reading or writing persisted daemon state failed.
    #[error("state I/O error at {path}: {source}")]
    StateIo {
        /// The file involved.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Another daemon already holds the PID file.
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning {
        /// PID of the running daemon.
        pid: u32,
    },

    /// A serial operation failed.
    #[error("serial error on {port}: {message}")]
    Serial {
        /// The port involved.
        port: String,
        /// Failure detail.
        message: String,
    },

    /// Closing a serial port that still has attached readers or a writer.
    #[error("port {port} still has {readers} reader(s) and writer={has_writer}")]
    PortBusy {
        /// The port involved.
        port: String,
        /// Remaining reader count.
        readers: usize,
        /// Whether a writer still holds the port.
        has_writer: bool,
    },

    /// The network listener could not be started.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
