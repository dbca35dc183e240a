use std::path::PathBuf;
use testbox_common::package::MalformedOutput;
use testbox_common::types::{FailureKind, InstanceFailure, Stage};
use thiserror::Error;

/// Failure of a single backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("instance {0} does not exist")]
    NotFound(String),
    #[error("{operation} on {instance} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        instance: String,
        seconds: u64,
    },
    #[error("malformed backend response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("could not find runtime source directory {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("could not construct payload for {entry}: {reason}")]
    PayloadConstruction { entry: String, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no bootstrap procedure for image {image} (family {family})")]
    UnsupportedImageFamily { image: String, family: String },
    #[error("hash mismatch for {}: expected {expected}, got {actual}", .path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("installer for {package} exited with {exit_code:?}: {stderr}")]
    InstallerFailed {
        package: String,
        exit_code: Option<i64>,
        stderr: String,
    },
    #[error(transparent)]
    PackageOutput(#[from] MalformedOutput),
    #[error("bootstrap step `{step}` exited with {exit_code:?}: {stderr}")]
    Bootstrap {
        step: String,
        exit_code: Option<i64>,
        stderr: String,
    },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            CoreError::SourceNotFound(_) => FailureKind::SourceNotFound,
            CoreError::PayloadConstruction { .. } => FailureKind::PayloadConstruction,
            CoreError::Backend(_) => FailureKind::Backend,
            CoreError::UnsupportedImageFamily { .. } => FailureKind::UnsupportedImageFamily,
            CoreError::Integrity { .. } => FailureKind::Integrity,
            CoreError::InstallerFailed { .. } => FailureKind::InstallerFailed,
            CoreError::PackageOutput(_) => FailureKind::PackageOutput,
            CoreError::Bootstrap { .. } => FailureKind::Bootstrap,
            CoreError::Io { .. } => FailureKind::Io,
        }
    }
}

/// An instance pipeline aborted at `stage`.
#[derive(Debug, Error)]
#[error("{instance}: {stage} failed: {source}")]
pub struct InstanceError {
    pub instance: String,
    pub stage: Stage,
    #[source]
    pub source: CoreError,
}

impl InstanceError {
    pub fn new(instance: impl Into<String>, stage: Stage, source: impl Into<CoreError>) -> Self {
        Self {
            instance: instance.into(),
            stage,
            source: source.into(),
        }
    }

    pub fn to_failure(&self) -> InstanceFailure {
        InstanceFailure {
            stage: self.stage,
            kind: self.source.kind(),
            message: self.source.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// Failed before any instance pipeline started
    #[error("run setup failed: {0}")]
    Setup(#[source] CoreError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

impl RunError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunError::Setup(_) => None,
            RunError::Instance(e) => Some(e.stage),
        }
    }
}
