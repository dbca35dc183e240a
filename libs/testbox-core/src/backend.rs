//! Execution backend seam.
//!
//! The lifecycle controller only talks to instances through
//! [`ExecutionBackend`]. Every call is treated as blocking: a pipeline awaits
//! each one in sequence, bounded by the run's configured timeouts.

use crate::error::BackendError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use testbox_common::config::TimeoutConfig;
use testbox_common::types::Environment;

/// Reference to a created instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub name: String,
}

impl InstanceHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
}

/// Creation parameters, resolved from the image catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub image: String,
    pub memory_limit_mb: Option<u32>,
    pub cpu_limit: Option<f32>,
}

/// Output of a remote execution as the backend captured it.
///
/// A `None` stream was not captured (e.g. a detached exec).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExecution {
    pub exit_code: Option<i64>,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl RawExecution {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        self.stdout
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, BackendError>;

    /// Status of an instance known to exist
    async fn status(&self, name: &str) -> Result<InstanceStatus, BackendError>;

    /// Create (but do not start) an instance
    async fn create(&self, config: &InstanceConfig) -> Result<InstanceHandle, BackendError>;

    async fn start(&self, handle: &InstanceHandle) -> Result<(), BackendError>;

    async fn stop(&self, handle: &InstanceHandle) -> Result<(), BackendError>;

    async fn delete(&self, handle: &InstanceHandle) -> Result<(), BackendError>;

    async fn put_file(
        &self,
        handle: &InstanceHandle,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError>;

    async fn execute(
        &self,
        handle: &InstanceHandle,
        argv: &[String],
        env: &Environment,
    ) -> Result<RawExecution, BackendError>;

    /// Handle for an instance that already exists
    fn handle(&self, name: &str) -> InstanceHandle {
        InstanceHandle::new(name)
    }
}

/// Bound a backend call by `limit`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    instance: &str,
    limit: Duration,
    fut: F,
) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            operation,
            instance: instance.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// Backend operations against one instance, with the run's timeouts applied.
pub struct Session<'a> {
    backend: &'a dyn ExecutionBackend,
    handle: InstanceHandle,
    timeouts: TimeoutConfig,
}

impl<'a> Session<'a> {
    pub fn new(backend: &'a dyn ExecutionBackend, handle: InstanceHandle, timeouts: TimeoutConfig) -> Self {
        Self {
            backend,
            handle,
            timeouts,
        }
    }

    pub fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    pub async fn start(&self) -> Result<(), BackendError> {
        with_timeout(
            "start",
            &self.handle.name,
            self.timeouts.lifecycle(),
            self.backend.start(&self.handle),
        )
        .await
    }

    pub async fn stop(&self) -> Result<(), BackendError> {
        with_timeout(
            "stop",
            &self.handle.name,
            self.timeouts.lifecycle(),
            self.backend.stop(&self.handle),
        )
        .await
    }

    pub async fn delete(&self) -> Result<(), BackendError> {
        with_timeout(
            "delete",
            &self.handle.name,
            self.timeouts.lifecycle(),
            self.backend.delete(&self.handle),
        )
        .await
    }

    pub async fn put_file(&self, remote_path: &str, contents: &[u8]) -> Result<(), BackendError> {
        with_timeout(
            "put_file",
            &self.handle.name,
            self.timeouts.lifecycle(),
            self.backend.put_file(&self.handle, remote_path, contents),
        )
        .await
    }

    pub async fn execute(&self, argv: &[String], env: &Environment) -> Result<RawExecution, BackendError> {
        with_timeout(
            "execute",
            &self.handle.name,
            self.timeouts.execute(),
            self.backend.execute(&self.handle, argv, env),
        )
        .await
    }

    /// `chmod +x` a transferred script, then run it.
    pub async fn run_script(&self, remote_path: &str, env: &Environment) -> Result<RawExecution, BackendError> {
        let chmod = argv(&["chmod", "+x", remote_path]);
        let marked = self.execute(&chmod, &Environment::new()).await?;
        if !marked.succeeded() {
            return Err(BackendError::Other(format!(
                "chmod +x {} exited with {:?}: {}",
                remote_path,
                marked.exit_code,
                marked.stderr_lossy().trim()
            )));
        }
        self.execute(&argv(&[remote_path]), env).await
    }
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
