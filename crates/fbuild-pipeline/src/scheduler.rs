//! DAG-based dependency scheduler.
//!
//! Holds the task graph behind one mutex; pool completion callbacks update
//! phases concurrently while the orchestrator polls readiness. A task is
//! ready when it is WAITING and every dependency is DONE; it is blocked
//! when any dependency is FAILED.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::PipelineError;
use crate::model::{PackageTask, TaskPhase};

/// Schedules package tasks based on their dependency DAG.
#[derive(Debug, Default)]
pub struct DependencyScheduler {
    tasks: Mutex<HashMap<String, PackageTask>>,
}

impl DependencyScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the graph.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateTask`] if the name is taken.
    pub fn add_task(&self, task: PackageTask) -> Result<(), PipelineError> {
        let mut tasks = self.tasks.lock().expect("scheduler mutex poisoned");
        if tasks.contains_key(&task.name) {
            return Err(PipelineError::DuplicateTask(task.name));
        }
        tasks.insert(task.name.clone(), task);
        Ok(())
    }

    /// Validate the graph: every dependency exists, no cycles.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownDependency`] or
    /// [`PipelineError::CyclicDependency`].
    pub fn validate(&self) -> Result<(), PipelineError> {
        let tasks = self.tasks.lock().expect("scheduler mutex poisoned");

        for task in tasks.values() {
            for dep in &task.dependencies {
                if !tasks.contains_key(dep) {
                    return Err(PipelineError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        detect_cycles(&tasks)
    }

    /// Tasks that are WAITING with every dependency DONE.
    #[must_use]
    pub fn ready_tasks(&self) -> Vec<PackageTask> {
        let tasks = self.tasks.lock().expect("scheduler mutex poisoned");
        tasks
            .values()
            .filter(|t| t.phase == TaskPhase::Waiting)
            .filter(|t| {
                t.dependencies.iter().all(|dep| {
                    tasks
                        .get(dep)
                        .is_some_and(|d| d.phase == TaskPhase::Done)
                })
            })
            .cloned()
            .collect()
    }

    /// WAITING tasks with at least one FAILED dependency, paired with the
    /// name of the first failed dependency found.
    #[must_use]
    pub fn blocked_tasks(&self) -> Vec<(PackageTask, String)> {
        let tasks = self.tasks.lock().expect("scheduler mutex poisoned");
        tasks
            .values()
            .filter(|t| t.phase == TaskPhase::Waiting)
            .filter_map(|t| {
                t.dependencies
                    .iter()
                    .find(|dep| {
                        tasks
                            .get(dep.as_str())
                            .is_some_and(|d| d.phase == TaskPhase::Failed)
                    })
                    .map(|dep| (t.clone(), dep.clone()))
            })
            .collect()
    }

    /// Update a task's phase.
    pub fn mark_phase(&self, name: &str, phase: TaskPhase) {
        let mut tasks = self.tasks.lock().expect("scheduler mutex poisoned");
        if let Some(task) = tasks.get_mut(name) {
            task.phase = phase;
        }
    }

    /// Mutate a task in place under the scheduler lock.
    pub fn with_task<R>(&self, name: &str, f: impl FnOnce(&mut PackageTask) -> R) -> Option<R> {
        let mut tasks = self.tasks.lock().expect("scheduler mutex poisoned");
        tasks.get_mut(name).map(f)
    }

    /// Snapshot a task by name.
    #[must_use]
    pub fn get_task(&self, name: &str) -> Option<PackageTask> {
        self.tasks
            .lock()
            .expect("scheduler mutex poisoned")
            .get(name)
            .cloned()
    }

    /// True when every task is DONE or FAILED.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.tasks
            .lock()
            .expect("scheduler mutex poisoned")
            .values()
            .all(|t| t.phase.is_terminal())
    }

    /// True when at least one task is FAILED.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.tasks
            .lock()
            .expect("scheduler mutex poisoned")
            .values()
            .any(|t| t.phase == TaskPhase::Failed)
    }

    /// Snapshot every task.
    #[must_use]
    pub fn all_tasks(&self) -> Vec<PackageTask> {
        self.tasks
            .lock()
            .expect("scheduler mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Total number of tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("scheduler mutex poisoned").len()
    }
}

/// DFS cycle detection with white/gray/black coloring.
fn detect_cycles(tasks: &HashMap<String, PackageTask>) -> Result<(), PipelineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<&str, Color> =
        tasks.keys().map(|k| (k.as_str(), Color::White)).collect();

    // Iterative DFS: (node, next-dependency index) frames with an explicit
    // path so the cycle can be reported in order.
    for start in tasks.keys() {
        if color[start.as_str()] != Color::White {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        let mut path: Vec<&str> = vec![start.as_str()];
        color.insert(start.as_str(), Color::Gray);

        while let Some((node, idx)) = stack.pop() {
            let deps = &tasks[node].dependencies;
            if idx < deps.len() {
                stack.push((node, idx + 1));
                let dep = deps[idx].as_str();
                match color[dep] {
                    Color::Gray => {
                        let cycle_start =
                            path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<&str> = path[cycle_start..].to_vec();
                        cycle.push(dep);
                        return Err(PipelineError::CyclicDependency(cycle.join(" -> ")));
                    },
                    Color::White => {
                        color.insert(dep, Color::Gray);
                        path.push(dep);
                        stack.push((dep, 0));
                    },
                    Color::Black => {},
                }
            } else {
                color.insert(node, Color::Black);
                path.pop();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, deps: &[&str]) -> PackageTask {
        PackageTask::new(name, format!("http://x/{name}.tgz"), "1.0", format!("/tmp/{name}"))
            .with_dependencies(deps.iter().map(|s| (*s).to_owned()))
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let s = DependencyScheduler::new();
        s.add_task(task("a", &[])).unwrap();
        assert!(matches!(
            s.add_task(task("a", &[])),
            Err(PipelineError::DuplicateTask(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let s = DependencyScheduler::new();
        s.add_task(task("lib", &["tool"])).unwrap();
        assert!(matches!(
            s.validate(),
            Err(PipelineError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let s = DependencyScheduler::new();
        s.add_task(task("a", &["b"])).unwrap();
        s.add_task(task("b", &["c"])).unwrap();
        s.add_task(task("c", &["a"])).unwrap();
        let err = s.validate().unwrap_err();
        assert!(matches!(err, PipelineError::CyclicDependency(_)));
    }

    #[test]
    fn test_self_cycle_detected() {
        let s = DependencyScheduler::new();
        s.add_task(task("a", &["a"])).unwrap();
        assert!(matches!(
            s.validate(),
            Err(PipelineError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_readiness_follows_dependencies() {
        let s = DependencyScheduler::new();
        s.add_task(task("tool", &[])).unwrap();
        s.add_task(task("lib", &["tool"])).unwrap();
        s.validate().unwrap();

        let ready: Vec<String> = s.ready_tasks().into_iter().map(|t| t.name).collect();
        assert_eq!(ready, vec!["tool".to_owned()]);

        s.mark_phase("tool", TaskPhase::Done);
        let ready: Vec<String> = s.ready_tasks().into_iter().map(|t| t.name).collect();
        assert_eq!(ready, vec!["lib".to_owned()]);
        assert!(!s.all_done());
    }

    #[test]
    fn test_blocked_reports_failed_dependency() {
        let s = DependencyScheduler::new();
        s.add_task(task("tool", &[])).unwrap();
        s.add_task(task("lib", &["tool"])).unwrap();
        s.mark_phase("tool", TaskPhase::Failed);

        let blocked = s.blocked_tasks();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].0.name, "lib");
        assert_eq!(blocked[0].1, "tool");
    }

    #[test]
    fn test_all_done_with_mixed_terminals() {
        let s = DependencyScheduler::new();
        s.add_task(task("a", &[])).unwrap();
        s.add_task(task("b", &[])).unwrap();
        s.mark_phase("a", TaskPhase::Done);
        s.mark_phase("b", TaskPhase::Failed);
        assert!(s.all_done());
        assert!(s.has_failed());
    }
}
