// Run configuration
// Explicit, typed fields; required keys are checked and unknown keys rejected.

use crate::package::SetupHook;
use crate::types::{expand_descriptors, EnvironmentDescriptor, Environment};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const REQUIRED_KEYS: &[&str] = &["name", "images", "runtime_dir"];
const OPTIONAL_KEYS: &[&str] = &["preserve", "environment", "hooks", "max_parallel", "timeouts"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read run config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run config must be a JSON object")]
    NotAnObject,
    #[error("run config is missing required keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),
    #[error("run config has unknown keys: {}", .0.join(", "))]
    UnknownKeys(Vec<String>),
    #[error("failed to parse run config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid run config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Bound on create/start/stop/delete/file transfer/existence calls
    #[serde(default = "default_lifecycle_secs")]
    pub lifecycle_secs: u64,
    /// Bound on each remote execution (bootstrap steps, installers, payload)
    #[serde(default = "default_execute_secs")]
    pub execute_secs: u64,
}

fn default_lifecycle_secs() -> u64 {
    120
}

fn default_execute_secs() -> u64 {
    600
}

fn default_max_parallel() -> usize {
    4
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lifecycle_secs: default_lifecycle_secs(),
            execute_secs: default_execute_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn lifecycle(&self) -> Duration {
        Duration::from_secs(self.lifecycle_secs)
    }

    pub fn execute(&self) -> Duration {
        Duration::from_secs(self.execute_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Base name; instance names are `{name}-{image tag}`
    pub name: String,
    pub images: Vec<String>,
    /// Skip teardown, leaving instances running
    #[serde(default)]
    pub preserve: bool,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub hooks: Vec<SetupHook>,
    /// Host directory packaged and injected into new instances
    pub runtime_dir: PathBuf,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl RunConfig {
    /// Build a config from an arbitrary JSON value.
    ///
    /// Missing required keys and unknown keys are reported by name before
    /// any field is parsed.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let object = value.as_object().ok_or(ConfigError::NotAnObject)?;

        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|key| !object.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }

        let mut unknown: Vec<String> = object
            .keys()
            .filter(|key| {
                !REQUIRED_KEYS.contains(&key.as_str()) && !OPTIONAL_KEYS.contains(&key.as_str())
            })
            .cloned()
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(ConfigError::UnknownKeys(unknown));
        }

        let config: RunConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a run config file. Relative paths inside it resolve against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let mut config = Self::from_value(value)?;

        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        if self.runtime_dir.is_relative() {
            self.runtime_dir = base.join(&self.runtime_dir);
        }
        for hook in &mut self.hooks {
            for pkg in &mut hook.packages {
                if pkg.path.is_relative() {
                    pkg.path = base.join(&pkg.path);
                }
                pkg.loader.source.rebase(base);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(ConfigError::Invalid(format!(
                "name '{}' may only contain [A-Za-z0-9_.-]",
                self.name
            )));
        }
        if self.images.is_empty() {
            return Err(ConfigError::Invalid("images must list at least one image".to_string()));
        }

        let mut seen = HashSet::new();
        for image in &self.images {
            let name = crate::types::instance_name(&self.name, image);
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "image '{}' maps to instance name '{}' more than once",
                    image, name
                )));
            }
        }

        if self.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".to_string()));
        }
        if self.timeouts.lifecycle_secs == 0 || self.timeouts.execute_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        for hook in &self.hooks {
            for pkg in &hook.packages {
                if pkg.hash.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "package {} has an empty hash",
                        pkg.path.display()
                    )));
                }
                if pkg.file_name().is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "package path {} has no file name",
                        pkg.path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn descriptors(&self) -> Vec<EnvironmentDescriptor> {
        expand_descriptors(&self.name, &self.images)
    }

    /// Fresh hook queue in enqueue order.
    pub fn hook_queue(&self) -> VecDeque<SetupHook> {
        self.hooks.iter().cloned().collect()
    }
}
