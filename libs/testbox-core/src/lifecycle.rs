/// Lifecycle Controller - Per-Instance Pipeline
///
/// **Core Responsibility:**
/// Drive one instance from "unknown" to "payload executed", then tear it
/// down or retain it.
///
/// **State Machine:**
/// ```text
/// Unchecked ─┬─ NotFound ──── create+start ── Provisioned ── Bootstrapped ─┐
///            ├─ FoundStopped ─ start ──────── Provisioned ─────────────────┤
///            └─ FoundRunning ──────────────── Provisioned ─────────────────┤
///                                                                          │
///            Hooked ── PayloadExecuted ── TornDown | Retained  ◄───────────┘
/// ```
///
/// Any error aborts the pipeline with an `InstanceError` naming the stage.
/// Failed pipelines that do not preserve instances get one best-effort
/// teardown attempt; its failures are logged and never replace the original
/// error.
use crate::aggregator;
use crate::backend::{with_timeout, ExecutionBackend, InstanceHandle, InstanceStatus, RawExecution, Session};
use crate::bootstrap::{BootstrapInjector, REMOTE_ARCHIVE_PATH, REMOTE_INJECTOR_PATH};
use crate::catalog::{ImageCatalog, ImageConfig};
use crate::error::{CoreError, InstanceError};
use crate::installer;
use crate::payload::{TestFunction, REMOTE_PAYLOAD_PATH};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use testbox_common::config::TimeoutConfig;
use testbox_common::package::SetupHook;
use testbox_common::types::{Environment, EnvironmentDescriptor, ExecutionResult, Stage};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unchecked,
    NotFound,
    FoundStopped,
    FoundRunning,
    Provisioned,
    Bootstrapped,
    Hooked,
    PayloadExecuted,
    TornDown,
    Retained,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Unchecked => "unchecked",
            InstanceState::NotFound => "not_found",
            InstanceState::FoundStopped => "found_stopped",
            InstanceState::FoundRunning => "found_running",
            InstanceState::Provisioned => "provisioned",
            InstanceState::Bootstrapped => "bootstrapped",
            InstanceState::Hooked => "hooked",
            InstanceState::PayloadExecuted => "payload_executed",
            InstanceState::TornDown => "torn_down",
            InstanceState::Retained => "retained",
        };
        write!(f, "{}", s)
    }
}

/// A finished pipeline: the payload's result plus the states it visited.
#[derive(Debug, Clone)]
pub struct InstanceRun {
    pub result: ExecutionResult,
    pub states: Vec<InstanceState>,
}

struct StateTrail {
    instance: String,
    states: Vec<InstanceState>,
}

impl StateTrail {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            states: vec![InstanceState::Unchecked],
        }
    }

    fn current(&self) -> InstanceState {
        self.states
            .last()
            .copied()
            .unwrap_or(InstanceState::Unchecked)
    }

    fn advance(&mut self, to: InstanceState) {
        debug!(instance = %self.instance, from = %self.current(), to = %to, "Instance transition");
        self.states.push(to);
    }
}

/// Runs instance pipelines against a shared backend.
///
/// Cheap to clone; parallel runs hand one clone to every task.
#[derive(Clone)]
pub struct LifecycleController {
    backend: Arc<dyn ExecutionBackend>,
    catalog: Arc<ImageCatalog>,
    runtime_archive: Arc<Vec<u8>>,
    preserve: bool,
    timeouts: TimeoutConfig,
}

impl LifecycleController {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        catalog: Arc<ImageCatalog>,
        runtime_archive: Arc<Vec<u8>>,
        preserve: bool,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            backend,
            catalog,
            runtime_archive,
            preserve,
            timeouts,
        }
    }

    /// Run the full pipeline for one instance.
    ///
    /// `hooks` and `env` are this instance's own copies: hooks are drained
    /// front to back and package side effects only reach this instance.
    #[tracing::instrument(skip_all, fields(instance = %descriptor.name, image = %descriptor.image))]
    pub async fn run_instance(
        &self,
        descriptor: &EnvironmentDescriptor,
        hooks: VecDeque<SetupHook>,
        env: Environment,
        function: &TestFunction,
    ) -> Result<InstanceRun, InstanceError> {
        let mut descriptor = descriptor.clone();
        let mut trail = StateTrail::new(&descriptor.name);
        let mut held: Option<InstanceHandle> = None;

        let outcome = self
            .drive(&mut descriptor, hooks, env, function, &mut trail, &mut held)
            .await;

        match outcome {
            Ok(result) => {
                info!(exit_code = ?result.exit_code, final_state = %trail.current(), "Instance finished");
                Ok(InstanceRun {
                    result,
                    states: trail.states,
                })
            }
            Err(e) => {
                warn!(stage = %e.stage, error = %e.source, "Instance pipeline failed");
                if let Some(handle) = held {
                    if !self.preserve {
                        self.teardown_after_failure(&handle).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        descriptor: &mut EnvironmentDescriptor,
        mut hooks: VecDeque<SetupHook>,
        mut env: Environment,
        function: &TestFunction,
        trail: &mut StateTrail,
        held: &mut Option<InstanceHandle>,
    ) -> Result<ExecutionResult, InstanceError> {
        let name = descriptor.name.clone();
        let fail = |stage: Stage| {
            let name = name.clone();
            move |e: CoreError| InstanceError::new(name, stage, e)
        };

        let image = self.catalog.get_config(&descriptor.image);

        // check
        let status = self.check(descriptor).await.map_err(fail(Stage::Check))?;
        trail.advance(match status {
            None => InstanceState::NotFound,
            Some(InstanceStatus::Stopped) => InstanceState::FoundStopped,
            Some(InstanceStatus::Running) => InstanceState::FoundRunning,
        });

        // provision, bootstrap only when newly created
        let session = match status {
            None => {
                let injector = BootstrapInjector::for_image(&image).map_err(fail(Stage::Bootstrap))?;

                let handle = with_timeout(
                    "create",
                    &name,
                    self.timeouts.lifecycle(),
                    self.backend.create(&image.instance_config(&name)),
                )
                .await
                .map_err(|e| fail(Stage::Provision)(e.into()))?;
                *held = Some(handle.clone());

                let session = Session::new(self.backend.as_ref(), handle, self.timeouts);
                session
                    .start()
                    .await
                    .map_err(|e| fail(Stage::Provision)(e.into()))?;
                trail.advance(InstanceState::Provisioned);

                self.bootstrap(&session, &injector, &image)
                    .await
                    .map_err(fail(Stage::Bootstrap))?;
                trail.advance(InstanceState::Bootstrapped);
                session
            }
            Some(existing) => {
                let handle = self.backend.handle(&name);
                *held = Some(handle.clone());
                let session = Session::new(self.backend.as_ref(), handle, self.timeouts);
                if existing == InstanceStatus::Stopped {
                    session
                        .start()
                        .await
                        .map_err(|e| fail(Stage::Provision)(e.into()))?;
                }
                trail.advance(InstanceState::Provisioned);
                session
            }
        };

        // hooks
        let mut installed = 0usize;
        while let Some(hook) = hooks.pop_front() {
            for package in &hook.packages {
                installer::install_package(&session, package, &mut env)
                    .await
                    .map_err(fail(Stage::Hooks))?;
                installed += 1;
            }
        }
        debug!(instance = %name, packages = installed, env_vars = env.len(), "Setup hooks drained");
        trail.advance(InstanceState::Hooked);

        // payload
        let payload = function.build().map_err(fail(Stage::Payload))?;
        session
            .put_file(REMOTE_PAYLOAD_PATH, payload.as_bytes())
            .await
            .map_err(|e| fail(Stage::Execute)(e.into()))?;
        let raw = session
            .run_script(REMOTE_PAYLOAD_PATH, &env)
            .await
            .map_err(|e| fail(Stage::Execute)(e.into()))?;
        let result = aggregator::process(raw);
        trail.advance(InstanceState::PayloadExecuted);

        // teardown
        if self.preserve {
            trail.advance(InstanceState::Retained);
        } else {
            // delete is attempted even when stop fails; either way the
            // failure path must not tear down a second time
            let stopped = session.stop().await;
            let deleted = session.delete().await;
            held.take();
            stopped.map_err(|e| fail(Stage::Teardown)(e.into()))?;
            deleted.map_err(|e| fail(Stage::Teardown)(e.into()))?;
            trail.advance(InstanceState::TornDown);
        }

        Ok(result)
    }

    /// Existence query, then status for instances that exist.
    async fn check(&self, descriptor: &mut EnvironmentDescriptor) -> Result<Option<InstanceStatus>, CoreError> {
        let backend = self.backend.as_ref();
        let name = descriptor.name.clone();
        let limit = self.timeouts.lifecycle();

        descriptor.exists = with_timeout("exists", &name, limit, backend.exists(&name)).await?;
        if !descriptor.exists {
            return Ok(None);
        }
        let status = with_timeout("status", &name, limit, backend.status(&name)).await?;
        Ok(Some(status))
    }

    async fn bootstrap(
        &self,
        session: &Session<'_>,
        injector: &BootstrapInjector,
        image: &ImageConfig,
    ) -> Result<(), CoreError> {
        session
            .put_file(REMOTE_ARCHIVE_PATH, &self.runtime_archive)
            .await?;
        let script = injector.build_injection_script(REMOTE_ARCHIVE_PATH);
        session
            .put_file(REMOTE_INJECTOR_PATH, script.as_bytes())
            .await?;

        let injected = session
            .run_script(REMOTE_INJECTOR_PATH, &Environment::new())
            .await?;
        check_step(REMOTE_INJECTOR_PATH, &injected)?;

        let mut tooling_env = Environment::new();
        tooling_env.add("DEBIAN_FRONTEND", "noninteractive");
        for step in injector.family().tooling_steps(&image.pip_packages) {
            let raw = session.execute(&step, &tooling_env).await?;
            check_step(&step.join(" "), &raw)?;
        }

        info!(
            instance = %session.handle().name,
            family = ?injector.family(),
            "Runtime injected"
        );
        Ok(())
    }

    /// Best-effort teardown of an instance whose pipeline never returned
    /// (its task panicked). Preserving runs leave it alone.
    pub async fn discard(&self, name: &str) {
        if self.preserve {
            return;
        }
        let limit = self.timeouts.lifecycle();
        match with_timeout("exists", name, limit, self.backend.exists(name)).await {
            Ok(true) => self.teardown_after_failure(&self.backend.handle(name)).await,
            Ok(false) => {}
            Err(e) => warn!(instance = %name, error = %e, "Failed to check abandoned instance"),
        }
    }

    async fn teardown_after_failure(&self, handle: &InstanceHandle) {
        let session = Session::new(self.backend.as_ref(), handle.clone(), self.timeouts);
        if let Err(e) = session.stop().await {
            warn!(instance = %handle.name, error = %e, "Failed to stop instance after pipeline failure");
        }
        if let Err(e) = session.delete().await {
            warn!(instance = %handle.name, error = %e, "Failed to delete instance after pipeline failure");
        }
    }
}

fn check_step(step: &str, raw: &RawExecution) -> Result<(), CoreError> {
    if raw.succeeded() {
        return Ok(());
    }
    Err(CoreError::Bootstrap {
        step: step.to_string(),
        exit_code: raw.exit_code,
        stderr: raw.stderr_lossy(),
    })
}

