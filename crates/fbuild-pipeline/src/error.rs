//! Pipeline error types.

use thiserror::Error;

/// Fatal errors for a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Two tasks share a name.
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    /// A task names a dependency that does not exist.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        /// The declaring task.
        task: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The dependency graph contains a cycle. No tasks are executed.
    #[error("cyclic dependency detected: {0}")]
    CyclicDependency(String),

    /// The run was cancelled; surviving tasks were failed and partial
    /// artifacts cleaned up. Not an error condition worth logging as one.
    #[error("pipeline was cancelled")]
    Cancelled,
}

/// A phase-level failure, carried as a value out of pool workers.
///
/// Workers convert every internal error (HTTP status, I/O, bad archive,
/// exhausted retries) into one of these; nothing unwinds across the pool
/// boundary.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PhaseFailure {
    /// Human-readable failure detail, recorded on the task.
    pub message: String,
}

impl PhaseFailure {
    /// Build a failure from anything displayable.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
