//! Install-dependencies collaborator: drives the package pipeline.
//!
//! Package resolution (reading platform manifests, deciding which
//! toolchains and frameworks a project needs) is an external collaborator
//! behind [`PackageResolver`]; this module owns only the hand-off into the
//! parallel pipeline and the status bookkeeping around it.

use std::sync::Arc;

use tracing::{error, info};

use fbuild_pipeline::{LogProgress, PackageTask, ParallelPipeline, PipelineError};

use crate::context::DaemonContext;
use crate::mainloop::OperationProcessor;
use crate::requests::{BuildRequest, DeployRequest, InstallDepsRequest, MonitorRequest};
use crate::status::DaemonState;

/// Resolves a request into the package tasks it needs.
pub trait PackageResolver: Send + Sync {
    /// Compute the task graph for an install-deps request. Already-present
    /// packages (valid fingerprints) should be omitted.
    fn resolve(&self, request: &InstallDepsRequest, context: &DaemonContext) -> Vec<PackageTask>;
}

/// Operation processor that materializes dependencies through the
/// pipeline and logs the rest (builds and deploys hand off to toolchain
/// collaborators that live outside the kernel).
pub struct PipelineProcessor {
    resolver: Arc<dyn PackageResolver>,
}

impl PipelineProcessor {
    /// Create a processor over a resolver.
    #[must_use]
    pub fn new(resolver: Arc<dyn PackageResolver>) -> Self {
        Self { resolver }
    }
}

impl std::fmt::Debug for PipelineProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineProcessor").finish_non_exhaustive()
    }
}

impl OperationProcessor for PipelineProcessor {
    fn process_build(&self, request: &BuildRequest, _context: &DaemonContext) {
        info!(project = %request.project_dir, env = %request.environment,
            "build requested (toolchain collaborator not wired)");
    }

    fn process_deploy(&self, request: &DeployRequest, _context: &DaemonContext) {
        info!(project = %request.project_dir, port = %request.port,
            "deploy requested (flash collaborator not wired)");
    }

    fn process_monitor(&self, request: &MonitorRequest, _context: &DaemonContext) {
        info!(port = %request.port, "monitor requested (monitor collaborator not wired)");
    }

    fn process_install_deps(&self, request: &InstallDepsRequest, context: &DaemonContext) {
        let tasks = self.resolver.resolve(request, context);
        if tasks.is_empty() {
            info!(project = %request.project_dir, "all dependencies already installed");
            return;
        }

        info!(count = tasks.len(), "materializing package dependencies");
        context.status.update_status(
            DaemonState::Installing,
            format!("Installing {} package(s)", tasks.len()),
        );

        let pipeline = ParallelPipeline::new(
            context.config.pipeline.download_workers,
            context.config.pipeline.unpack_workers,
            context.config.pipeline.install_workers,
        );

        // Processors run on blocking threads; re-enter the runtime for the
        // pipeline's async orchestration.
        let outcome = tokio::runtime::Handle::current()
            .block_on(pipeline.run(tasks, Arc::new(LogProgress)));

        match outcome {
            Ok(result) if result.success => {
                info!(
                    completed = result.completed_count(),
                    elapsed_secs = result.total_elapsed_secs,
                    "dependency installation complete"
                );
            },
            Ok(result) => {
                for task in result.failed_tasks() {
                    error!(task = %task.name, error = %task.error_message, "package failed");
                }
            },
            Err(PipelineError::Cancelled) => {
                info!("dependency installation cancelled");
            },
            Err(e) => {
                error!(error = %e, "pipeline failed to start");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::StaticEnumerator;
    use crate::serial::LoopbackProvider;
    use fbuild_config::DaemonConfig;
    use fbuild_core::FbuildHome;

    struct EmptyResolver;
    impl PackageResolver for EmptyResolver {
        fn resolve(&self, _: &InstallDepsRequest, _: &DaemonContext) -> Vec<PackageTask> {
            Vec::new()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_resolution_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let context = DaemonContext::new(
            FbuildHome::from_path(tmp.path()),
            DaemonConfig::default(),
            Box::new(StaticEnumerator::new(Vec::new())),
            Arc::new(LoopbackProvider::new()),
            None,
        )
        .unwrap();
        let processor = PipelineProcessor::new(Arc::new(EmptyResolver));
        let request = InstallDepsRequest {
            project_dir: "/p".into(),
            environment: "e".into(),
            verbose: false,
            operation_id: None,
        };
        let ctx = Arc::clone(&context);
        tokio::task::spawn_blocking(move || processor.process_install_deps(&request, &ctx))
            .await
            .unwrap();
        assert!(!context.status.operation_in_progress());
    }
}
