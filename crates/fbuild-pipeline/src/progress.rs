//! Progress reporting.
//!
//! Pool workers report through one narrow interface; the caller decides
//! whether that feeds a no-op, the log, or a live renderer.

use tracing::{debug, info, warn};

use crate::model::TaskPhase;

/// Sink for per-task progress events.
///
/// Invoked from pool workers: implementations must be cheap and must not
/// block.
pub trait ProgressCallback: Send + Sync {
    /// Report progress for `task` in `phase`. `progress`/`total` carry
    /// bytes for downloads, members for extraction, steps for install;
    /// `total` of 0 means unknown.
    fn on_progress(&self, task: &str, phase: TaskPhase, progress: u64, total: u64, detail: &str);
}

/// Discards all progress events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _task: &str, _phase: TaskPhase, _progress: u64, _total: u64, _detail: &str) {}
}

/// Emits progress through `tracing`.
///
/// Phase transitions and failures log at info/warn; per-chunk updates log
/// at debug to keep the stream readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressCallback for LogProgress {
    fn on_progress(&self, task: &str, phase: TaskPhase, progress: u64, total: u64, detail: &str) {
        match phase {
            TaskPhase::Failed => warn!(task, %phase, detail, "package task failed"),
            TaskPhase::Done => info!(task, %phase, detail, "package task done"),
            _ if progress == 0 || progress == total => {
                info!(task, %phase, progress, total, detail, "package task progress");
            },
            _ => debug!(task, %phase, progress, total, detail, "package task progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Test double collecting every event.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingProgress {
        pub(crate) events: Mutex<Vec<(String, TaskPhase, u64, u64, String)>>,
    }

    impl ProgressCallback for RecordingProgress {
        fn on_progress(&self, task: &str, phase: TaskPhase, progress: u64, total: u64, detail: &str) {
            self.events.lock().unwrap().push((
                task.to_owned(),
                phase,
                progress,
                total,
                detail.to_owned(),
            ));
        }
    }

    #[test]
    fn test_noop_and_log_accept_events() {
        NoopProgress.on_progress("t", TaskPhase::Downloading, 1, 2, "x");
        LogProgress.on_progress("t", TaskPhase::Done, 1, 1, "x");
    }

    #[test]
    fn test_recording_progress_collects() {
        let rec = RecordingProgress::default();
        rec.on_progress("t", TaskPhase::Installing, 2, 3, "verify");
        let events = rec.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, TaskPhase::Installing);
    }
}
