//! fbuild Pipeline - parallel package materialization.
//!
//! Toolchains, cores and libraries are described as [`PackageTask`]s in a
//! dependency DAG and processed through three resource-isolated pools in
//! strict order: download (network), unpack (disk), install (CPU). The
//! [`ParallelPipeline`] orchestrator submits tasks as their dependencies
//! complete, fails dependents of failed tasks, and cleans up partial
//! artifacts on cancellation.
//!
//! Pool workers never panic across the boundary: every phase resolves to an
//! explicit `Result<PathBuf, PhaseFailure>` the orchestrator inspects.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod model;
mod pipeline;
mod pools;
mod progress;
mod scheduler;

pub use error::{PhaseFailure, PipelineError};
pub use model::{PackageTask, PipelineResult, TaskPhase};
pub use pipeline::{CancelHandle, ParallelPipeline};
pub use pools::{DownloadPool, InstallPool, UnpackPool};
pub use progress::{LogProgress, NoopProgress, ProgressCallback};
pub use scheduler::DependencyScheduler;
