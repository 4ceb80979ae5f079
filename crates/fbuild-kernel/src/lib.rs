//! fbuild Kernel - the daemon core.
//!
//! Everything the running daemon is made of lives here:
//!
//! - [`status`]: single source of truth for daemon state, written atomically
//!   to the status file.
//! - [`registry`]: connected-client bookkeeping and dead-client detection.
//! - [`locks`]: the configuration lock manager keyed by
//!   (project, environment, port).
//! - [`devices`]: device inventory plus exclusive/monitor leases with
//!   preemption.
//! - [`serial`]: multiplexed serial sessions (many readers, one writer,
//!   per-port reader thread).
//! - [`ledger`]: the firmware deployment ledger.
//! - [`procs`]: per-client child-process tracking and orphan cleanup.
//! - [`server`]: the TCP/Unix-socket message router.
//! - [`mainloop`]: file-based request channels and housekeeping.
//! - [`context`]: the process-singleton wiring all of the above together.
//!
//! # Locking discipline
//!
//! Every manager guards its own maps with one internal mutex. Manager locks
//! are never nested: take one, snapshot what you need, release, then call
//! into the next manager. Blocking acquisitions (lock/writer timeouts) run
//! on `spawn_blocking` threads so the async router never stalls.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod context;
pub mod devices;
pub mod error;
mod fsio;
pub mod install;
pub mod ledger;
pub mod locks;
pub mod mainloop;
pub mod pidfile;
pub mod procs;
pub mod registry;
pub mod requests;
pub mod serial;
pub mod server;
pub mod status;

pub use context::DaemonContext;
pub use error::KernelError;
pub use server::DaemonServer;
