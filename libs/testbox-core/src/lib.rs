//! Environment lifecycle and execution pipeline for testbox.
//!
//! A [`runner::Runner`] expands a run configuration into one pipeline per
//! instance; [`lifecycle::LifecycleController`] drives each pipeline through
//! an [`backend::ExecutionBackend`], with [`docker::DockerBackend`] as the
//! production backend.

pub mod aggregator;
pub mod backend;
pub mod bootstrap;
pub mod catalog;
pub mod docker;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod payload;
pub mod runner;

#[cfg(test)]
mod testing;

pub use backend::{ExecutionBackend, InstanceHandle, InstanceStatus};
pub use catalog::ImageCatalog;
pub use error::{CoreError, InstanceError, RunError};
pub use payload::TestFunction;
pub use runner::{RunMode, Runner};
