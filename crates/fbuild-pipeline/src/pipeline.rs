//! Pipeline orchestrator connecting scheduler + pools.
//!
//! Ticks every ~50 ms: fails tasks blocked by failed dependencies, submits
//! ready tasks to the download pool, and transitions completed work through
//! unpack and install. Cancellation aborts in-flight work, fails survivors
//! and removes partial artifacts before surfacing
//! [`PipelineError::Cancelled`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PhaseFailure, PipelineError};
use crate::model::{PackageTask, PipelineResult, TaskPhase};
use crate::pools::{DownloadPool, InstallPool, Progress, UnpackPool};
use crate::progress::ProgressCallback;
use crate::scheduler::DependencyScheduler;

/// Orchestrator tick cadence.
const TICK_SLEEP: Duration = Duration::from_millis(50);

/// Requests cancellation of a running pipeline. Cloneable and thread-safe.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a fresh, un-cancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Orchestrates parallel package installation through the three pools.
pub struct ParallelPipeline {
    download_pool: DownloadPool,
    unpack_pool: UnpackPool,
    install_pool: InstallPool,
    cancel: CancelHandle,
}

impl ParallelPipeline {
    /// Create a pipeline with explicit pool sizes.
    #[must_use]
    pub fn new(download_workers: usize, unpack_workers: usize, install_workers: usize) -> Self {
        Self {
            download_pool: DownloadPool::new(download_workers),
            unpack_pool: UnpackPool::new(unpack_workers),
            install_pool: InstallPool::new(install_workers),
            cancel: CancelHandle::new(),
        }
    }

    /// Handle for cancelling this pipeline from another task or a signal
    /// handler.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute the pipeline on the given tasks.
    ///
    /// Returns when every task is DONE or FAILED.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateTask`],
    /// [`PipelineError::UnknownDependency`] or
    /// [`PipelineError::CyclicDependency`] before any task runs, and
    /// [`PipelineError::Cancelled`] when cancellation interrupts the run.
    pub async fn run(
        &self,
        tasks: Vec<PackageTask>,
        callback: Arc<dyn ProgressCallback>,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();

        if tasks.is_empty() {
            return Ok(PipelineResult {
                tasks: Vec::new(),
                total_elapsed_secs: 0.0,
                success: true,
            });
        }

        let scheduler = DependencyScheduler::new();
        for task in tasks {
            scheduler.add_task(task)?;
        }
        scheduler.validate()?;

        info!(tasks = scheduler.task_count(), "pipeline starting");

        // Active pool work: task name -> (phase submitted under, handle).
        let mut active: HashMap<String, (TaskPhase, JoinHandle<Result<PathBuf, PhaseFailure>>)> =
            HashMap::new();

        while !scheduler.all_done() {
            if self.cancel.is_cancelled() {
                self.abort_active(&mut active);
                fail_remaining(&scheduler, "Pipeline cancelled");
                cleanup_partial_artifacts(&scheduler);
                return Err(PipelineError::Cancelled);
            }

            fail_blocked_tasks(&scheduler, &callback);

            for task in scheduler.ready_tasks() {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.submit_download(&scheduler, &task.name, &callback, &mut active);
            }

            self.process_completed(&scheduler, &callback, &mut active);

            tokio::time::sleep(TICK_SLEEP).await;
        }

        let all_tasks = scheduler.all_tasks();
        let success = all_tasks.iter().all(|t| t.phase == TaskPhase::Done);
        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            success, "pipeline finished"
        );
        Ok(PipelineResult {
            tasks: all_tasks,
            total_elapsed_secs: started.elapsed().as_secs_f64(),
            success,
        })
    }

    fn submit_download(
        &self,
        scheduler: &DependencyScheduler,
        name: &str,
        callback: &Progress,
        active: &mut HashMap<String, (TaskPhase, JoinHandle<Result<PathBuf, PhaseFailure>>)>,
    ) {
        let snapshot = scheduler.with_task(name, |task| {
            task.mark_started();
            task.phase = TaskPhase::Downloading;
            task.clone()
        });
        let Some(task) = snapshot else { return };

        callback.on_progress(name, TaskPhase::Downloading, 0, 0, "Queued for download");
        let handle = self.download_pool.submit(&task, Arc::clone(callback));
        active.insert(name.to_owned(), (TaskPhase::Downloading, handle));
    }

    fn process_completed(
        &self,
        scheduler: &DependencyScheduler,
        callback: &Progress,
        active: &mut HashMap<String, (TaskPhase, JoinHandle<Result<PathBuf, PhaseFailure>>)>,
    ) {
        let finished: Vec<String> = active
            .iter()
            .filter(|(_, (_, handle))| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            let Some((phase, handle)) = active.remove(&name) else {
                continue;
            };
            let outcome = handle.now_or_never_result();

            match outcome {
                Ok(path) => self.transition(scheduler, &name, phase, path, callback, active),
                Err(failure) => {
                    scheduler.with_task(&name, |task| task.fail(failure.message.clone()));
                    callback.on_progress(&name, TaskPhase::Failed, 0, 0, &failure.message);
                },
            }
        }
    }

    fn transition(
        &self,
        scheduler: &DependencyScheduler,
        name: &str,
        completed_phase: TaskPhase,
        result_path: PathBuf,
        callback: &Progress,
        active: &mut HashMap<String, (TaskPhase, JoinHandle<Result<PathBuf, PhaseFailure>>)>,
    ) {
        match completed_phase {
            TaskPhase::Downloading => {
                let snapshot = scheduler.with_task(name, |task| {
                    task.archive_path = Some(result_path.clone());
                    task.phase = TaskPhase::Unpacking;
                    task.clone()
                });
                let Some(task) = snapshot else { return };
                callback.on_progress(name, TaskPhase::Unpacking, 0, 0, "Queued for extraction");
                let handle = self
                    .unpack_pool
                    .submit(&task, result_path, Arc::clone(callback));
                active.insert(name.to_owned(), (TaskPhase::Unpacking, handle));
            },
            TaskPhase::Unpacking => {
                let snapshot = scheduler.with_task(name, |task| {
                    task.extracted_path = Some(result_path.clone());
                    task.phase = TaskPhase::Installing;
                    task.clone()
                });
                let Some(task) = snapshot else { return };
                callback.on_progress(name, TaskPhase::Installing, 0, 0, "Queued for installation");
                let handle = self
                    .install_pool
                    .submit(&task, result_path, Arc::clone(callback));
                active.insert(name.to_owned(), (TaskPhase::Installing, handle));
            },
            TaskPhase::Installing => {
                let elapsed = scheduler
                    .with_task(name, |task| {
                        task.update_elapsed();
                        task.phase = TaskPhase::Done;
                        task.elapsed_secs
                    })
                    .unwrap_or(0.0);
                callback.on_progress(
                    name,
                    TaskPhase::Done,
                    1,
                    1,
                    &format!("Done in {elapsed:.1}s"),
                );
            },
            other => debug!(task = name, phase = %other, "unexpected completion phase"),
        }
    }

    fn abort_active(
        &self,
        active: &mut HashMap<String, (TaskPhase, JoinHandle<Result<PathBuf, PhaseFailure>>)>,
    ) {
        for (name, (_, handle)) in active.drain() {
            debug!(task = %name, "aborting in-flight pipeline work");
            handle.abort();
        }
    }
}

/// Mark tasks blocked by failed dependencies as FAILED.
fn fail_blocked_tasks(scheduler: &DependencyScheduler, callback: &Progress) {
    for (task, failed_dep) in scheduler.blocked_tasks() {
        let message = format!("Dependency '{failed_dep}' failed");
        scheduler.with_task(&task.name, |t| t.fail(message.clone()));
        callback.on_progress(&task.name, TaskPhase::Failed, 0, 0, &message);
    }
}

/// Mark every non-terminal task FAILED with `reason`.
fn fail_remaining(scheduler: &DependencyScheduler, reason: &str) {
    for task in scheduler.all_tasks() {
        if !task.phase.is_terminal() {
            scheduler.with_task(&task.name, |t| t.fail(reason.to_owned()));
        }
    }
}

/// Remove partial download files and temp extraction directories for failed
/// tasks. Best-effort: removal errors are ignored.
fn cleanup_partial_artifacts(scheduler: &DependencyScheduler) {
    for task in scheduler.all_tasks() {
        if task.phase != TaskPhase::Failed {
            continue;
        }
        let Some(parent) = task.dest_path.parent() else {
            continue;
        };
        let Ok(entries) = std::fs::read_dir(parent) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".download") {
                if std::fs::remove_file(&path).is_ok() {
                    debug!(path = %path.display(), "cleaned up partial download");
                }
            } else if name.starts_with("temp_extract_") && path.is_dir() {
                if std::fs::remove_dir_all(&path).is_ok() {
                    debug!(path = %path.display(), "cleaned up temp extraction dir");
                }
            }
        }
    }
}

/// Extension trait: join a finished handle without awaiting.
trait NowOrNever {
    fn now_or_never_result(self) -> Result<PathBuf, PhaseFailure>;
}

impl NowOrNever for JoinHandle<Result<PathBuf, PhaseFailure>> {
    fn now_or_never_result(self) -> Result<PathBuf, PhaseFailure> {
        match futures::FutureExt::now_or_never(self) {
            Some(Ok(result)) => result,
            Some(Err(join_error)) => {
                if join_error.is_cancelled() {
                    Err(PhaseFailure::new("Pipeline cancelled"))
                } else {
                    warn!(error = %join_error, "pipeline pool worker panicked");
                    Err(PhaseFailure::new(format!("pool worker panicked: {join_error}")))
                }
            },
            // Guarded by is_finished() before calling; treat as transient.
            None => Err(PhaseFailure::new("pool worker not finished")),
        }
    }
}
