//! Task and result models for the pipeline.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Phase of a package task in the pipeline.
///
/// Transitions are monotonic `Waiting -> Downloading -> Unpacking ->
/// Installing -> Done`, or from any non-terminal phase to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    /// Queued; dependencies not yet satisfied or not yet submitted.
    Waiting,
    /// In the download pool.
    Downloading,
    /// In the unpack pool.
    Unpacking,
    /// In the install pool.
    Installing,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
}

impl TaskPhase {
    /// Whether this phase is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The wire/progress name of this phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Unpacking => "unpacking",
            Self::Installing => "installing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single package to be processed through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageTask {
    /// Unique name within the task graph (e.g. `toolchain-xtensa`).
    pub name: String,
    /// Download URL for the package archive.
    pub url: String,
    /// Package version string.
    pub version: String,
    /// Final installation path.
    pub dest_path: PathBuf,
    /// Names of tasks that must be DONE before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Current pipeline phase.
    #[serde(default = "default_phase")]
    pub phase: TaskPhase,
    /// Human-readable status detail.
    #[serde(default)]
    pub status_text: String,
    /// Elapsed seconds since the task started processing.
    #[serde(default)]
    pub elapsed_secs: f64,
    /// Failure detail when `phase` is `Failed`.
    #[serde(default)]
    pub error_message: String,
    /// Downloaded archive path, set after the download phase.
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    /// Extraction path, set after the unpack phase.
    #[serde(default)]
    pub extracted_path: Option<PathBuf>,
    /// Total bytes to download, when the server advertises a length.
    #[serde(default)]
    pub total_bytes: u64,
    /// Bytes downloaded so far.
    #[serde(default)]
    pub downloaded_bytes: u64,
    /// Processing start instant; not serialized.
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

fn default_phase() -> TaskPhase {
    TaskPhase::Waiting
}

impl PackageTask {
    /// Describe a package to materialize.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
        dest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            version: version.into(),
            dest_path: dest_path.into(),
            dependencies: Vec::new(),
            phase: TaskPhase::Waiting,
            status_text: String::new(),
            elapsed_secs: 0.0,
            error_message: String::new(),
            archive_path: None,
            extracted_path: None,
            total_bytes: 0,
            downloaded_bytes: 0,
            started_at: None,
        }
    }

    /// Add dependency names.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    /// Record the processing start time.
    pub fn mark_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Refresh `elapsed_secs` from the start time.
    pub fn update_elapsed(&mut self) {
        if let Some(start) = self.started_at {
            self.elapsed_secs = start.elapsed().as_secs_f64();
        }
    }

    /// Mark the task failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.phase = TaskPhase::Failed;
        self.error_message = error.into();
        self.update_elapsed();
    }
}

/// Aggregated result of running the full pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Final state of all tasks.
    pub tasks: Vec<PackageTask>,
    /// Total wall-clock seconds.
    pub total_elapsed_secs: f64,
    /// True when every task is DONE.
    pub success: bool,
}

impl PipelineResult {
    /// Number of tasks that completed successfully.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Done)
            .count()
    }

    /// Number of tasks that failed.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Failed)
            .count()
    }

    /// The failed tasks.
    #[must_use]
    pub fn failed_tasks(&self) -> Vec<&PackageTask> {
        self.tasks
            .iter()
            .filter(|t| t.phase == TaskPhase::Failed)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_terminality() {
        assert!(TaskPhase::Done.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(!TaskPhase::Waiting.is_terminal());
        assert!(!TaskPhase::Installing.is_terminal());
    }

    #[test]
    fn test_fail_records_elapsed() {
        let mut task = PackageTask::new("t", "http://x/t.tgz", "1.0", "/tmp/t");
        task.mark_started();
        task.fail("boom");
        assert_eq!(task.phase, TaskPhase::Failed);
        assert_eq!(task.error_message, "boom");
        assert!(task.elapsed_secs >= 0.0);
    }

    #[test]
    fn test_result_counts() {
        let mut done = PackageTask::new("a", "u", "1", "/tmp/a");
        done.phase = TaskPhase::Done;
        let mut failed = PackageTask::new("b", "u", "1", "/tmp/b");
        failed.fail("no");
        let result = PipelineResult {
            tasks: vec![done, failed],
            total_elapsed_secs: 0.1,
            success: false,
        };
        assert_eq!(result.completed_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.failed_tasks()[0].name, "b");
    }
}
