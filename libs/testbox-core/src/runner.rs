// Run orchestration: expands a run config into instance pipelines and
// collects one outcome per instance.

use crate::aggregator;
use crate::backend::{with_timeout, ExecutionBackend, InstanceStatus};
use crate::bootstrap::RuntimeSource;
use crate::catalog::ImageCatalog;
use crate::error::{CoreError, RunError};
use crate::lifecycle::LifecycleController;
use crate::payload::TestFunction;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use testbox_common::config::RunConfig;
use testbox_common::types::{
    EnvironmentDescriptor, FailureKind, InstanceFailure, InstanceOutcome, RunResultSet, Stage,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One instance at a time, stopping at the first failure
    Serial,
    /// Up to `max_parallel` instances at once; failures are recorded
    Parallel,
}

/// Existence probe for one configured instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceProbe {
    pub name: String,
    pub image: String,
    /// `None` when the instance does not exist
    pub status: Option<InstanceStatus>,
}

impl InstanceProbe {
    pub fn state(&self) -> &'static str {
        match self.status {
            None => "absent",
            Some(InstanceStatus::Running) => "running",
            Some(InstanceStatus::Stopped) => "stopped",
        }
    }
}

pub struct Runner {
    backend: Arc<dyn ExecutionBackend>,
    catalog: Arc<ImageCatalog>,
    config: RunConfig,
}

impl Runner {
    pub fn new(backend: Arc<dyn ExecutionBackend>, catalog: Arc<ImageCatalog>, config: RunConfig) -> Self {
        Self {
            backend,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self, function: &TestFunction, mode: RunMode) -> Result<RunResultSet, RunError> {
        match mode {
            RunMode::Serial => self.serial(function).await,
            RunMode::Parallel => self.parallel(function).await,
        }
    }

    /// Package the runtime once and build the controller every pipeline
    /// shares. A missing runtime directory fails the run before any instance
    /// is touched.
    fn controller(&self) -> Result<LifecycleController, RunError> {
        let archive = RuntimeSource::new(&self.config.runtime_dir)
            .package_source()
            .map_err(RunError::Setup)?;
        info!(
            runtime_dir = %self.config.runtime_dir.display(),
            archive_bytes = archive.len(),
            "Runtime packaged"
        );

        Ok(LifecycleController::new(
            self.backend.clone(),
            self.catalog.clone(),
            Arc::new(archive),
            self.config.preserve,
            self.config.timeouts,
        ))
    }

    /// Run instances one after another in descriptor order.
    ///
    /// The first failing instance ends the run with that instance's error.
    #[tracing::instrument(skip_all, fields(run = %self.config.name))]
    pub async fn serial(&self, function: &TestFunction) -> Result<RunResultSet, RunError> {
        let controller = self.controller()?;
        let descriptors = self.config.descriptors();
        info!(instances = descriptors.len(), mode = "serial", "Starting run");

        let mut results = RunResultSet::new();
        for descriptor in &descriptors {
            let run = controller
                .run_instance(
                    descriptor,
                    self.config.hook_queue(),
                    self.config.environment.clone(),
                    function,
                )
                .await?;
            let outcome = InstanceOutcome::Completed(run.result);
            log_outcome(&descriptor.name, &outcome);
            results.record(descriptor.name.clone(), outcome);
        }

        info!(summary = ?aggregator::summarize(&results), "Run finished");
        Ok(results)
    }

    /// Run instances concurrently, bounded by `max_parallel`.
    ///
    /// Every instance gets an entry: pipeline errors and panicking tasks are
    /// recorded as failures without affecting siblings. A panicking pipeline
    /// never reaches its own teardown, so its instance is discarded by name.
    #[tracing::instrument(skip_all, fields(run = %self.config.name))]
    pub async fn parallel(&self, function: &TestFunction) -> Result<RunResultSet, RunError> {
        let controller = self.controller()?;
        let descriptors = self.config.descriptors();
        info!(
            instances = descriptors.len(),
            max_parallel = self.config.max_parallel,
            mode = "parallel",
            "Starting run"
        );

        let function = Arc::new(function.clone());
        let mut tasks = JoinSet::new();
        let mut results = RunResultSet::new();

        for descriptor in descriptors.iter().cloned() {
            // at most max_parallel pipelines in flight
            while tasks.len() >= self.config.max_parallel {
                match tasks.join_next().await {
                    Some(joined) => collect(&mut results, joined),
                    None => break,
                }
            }

            let controller = controller.clone();
            let function = function.clone();
            let hooks = self.config.hook_queue();
            let env = self.config.environment.clone();

            tasks.spawn(async move {
                let name = descriptor.name.clone();
                let pipeline = controller.run_instance(&descriptor, hooks, env, &function);
                let outcome = match AssertUnwindSafe(pipeline).catch_unwind().await {
                    Ok(result) => aggregator::outcome(result.map(|run| run.result)),
                    Err(panic) => {
                        controller.discard(&name).await;
                        join_failure(FailureKind::Panicked, panic_message(panic))
                    }
                };
                (name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            collect(&mut results, joined);
        }

        record_missing(&mut results, &descriptors);
        info!(summary = ?aggregator::summarize(&results), "Run finished");
        Ok(results)
    }

    /// Existence and running state of every configured instance.
    pub async fn status(&self) -> Result<Vec<InstanceProbe>, CoreError> {
        let limit = self.config.timeouts.lifecycle();
        let mut probes = Vec::new();
        for descriptor in self.config.descriptors() {
            let name = descriptor.name.as_str();
            let exists = with_timeout("exists", name, limit, self.backend.exists(name)).await?;
            let status = if exists {
                Some(with_timeout("status", name, limit, self.backend.status(name)).await?)
            } else {
                None
            };
            probes.push(InstanceProbe {
                name: descriptor.name.clone(),
                image: descriptor.image.clone(),
                status,
            });
        }
        Ok(probes)
    }
}

fn collect(
    results: &mut RunResultSet,
    joined: Result<(String, InstanceOutcome), tokio::task::JoinError>,
) {
    match joined {
        Ok((name, outcome)) => {
            log_outcome(&name, &outcome);
            if !results.record(name.clone(), outcome) {
                warn!(instance = %name, "Duplicate result ignored");
            }
        }
        Err(e) => error!("Instance task did not complete: {}", e),
    }
}

fn join_failure(kind: FailureKind, message: String) -> InstanceOutcome {
    InstanceOutcome::Failed(InstanceFailure {
        stage: Stage::Join,
        kind,
        message,
    })
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("instance task panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("instance task panicked: {}", s)
    } else {
        "instance task panicked".to_string()
    }
}

/// Give every descriptor without an outcome a join failure.
fn record_missing(results: &mut RunResultSet, descriptors: &[EnvironmentDescriptor]) {
    for descriptor in descriptors {
        if results.get(&descriptor.name).is_none() {
            results.record(
                descriptor.name.clone(),
                join_failure(FailureKind::Panicked, "instance task was lost".to_string()),
            );
        }
    }
}

fn log_outcome(name: &str, outcome: &InstanceOutcome) {
    match outcome {
        InstanceOutcome::Completed(result) => {
            info!(instance = %name, exit_code = ?result.exit_code, "Instance completed")
        }
        InstanceOutcome::Failed(failure) => warn!(
            instance = %name,
            stage = %failure.stage,
            kind = ?failure.kind,
            "Instance failed: {}",
            failure.message
        ),
    }
}
