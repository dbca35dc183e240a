use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Declarative record for one backing instance of a run.
///
/// `exists` is re-derived by the pre-flight check on every run and is only
/// meaningful right after that check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub exists: bool,
}

impl EnvironmentDescriptor {
    pub fn new(base: &str, image: &str) -> Self {
        Self {
            name: instance_name(base, image),
            image: image.to_string(),
            exists: false,
        }
    }
}

/// Instance name for an image within a run: `{base}-{tag}`.
///
/// Characters outside the Docker container-name alphabet become `-`.
pub fn instance_name(base: &str, image: &str) -> String {
    let tag: String = image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", base, tag)
}

/// Expand a base name and image list into one descriptor per image.
///
/// Two images that sanitize to the same name get a numeric suffix so that
/// every descriptor in the returned set has a distinct name.
pub fn expand_descriptors(base: &str, images: &[String]) -> Vec<EnvironmentDescriptor> {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(images.len());

    for image in images {
        let mut descriptor = EnvironmentDescriptor::new(base, image);
        let stem = descriptor.name.clone();
        let mut n = 2;
        while !seen.insert(descriptor.name.clone()) {
            descriptor.name = format!("{}-{}", stem, n);
            n += 1;
        }
        descriptors.push(descriptor);
    }

    descriptors
}

/// Environment variables visible to the payload.
///
/// Starts from caller-supplied variables and grows through package side
/// effects. Each instance pipeline owns its own copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// `KEY=VALUE` pairs in key order, the form container runtimes expect.
    pub fn dump(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Normalized outcome of running a payload.
///
/// `None` means the field was not captured, which is not the same as an
/// empty string or a zero exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Pipeline stage an instance failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Check,
    Provision,
    Bootstrap,
    Hooks,
    Payload,
    Execute,
    Teardown,
    Join,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Check => "check",
            Stage::Provision => "provision",
            Stage::Bootstrap => "bootstrap",
            Stage::Hooks => "hooks",
            Stage::Payload => "payload",
            Stage::Execute => "execute",
            Stage::Teardown => "teardown",
            Stage::Join => "join",
        };
        write!(f, "{}", s)
    }
}

/// Error category recorded with a failed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceNotFound,
    PayloadConstruction,
    Backend,
    UnsupportedImageFamily,
    Integrity,
    InstallerFailed,
    PackageOutput,
    Bootstrap,
    Io,
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Completed(ExecutionResult),
    Failed(InstanceFailure),
}

impl InstanceOutcome {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            InstanceOutcome::Completed(result) => Some(result),
            InstanceOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&InstanceFailure> {
        match self {
            InstanceOutcome::Completed(_) => None,
            InstanceOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Mapping from instance name to outcome, filled once per instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunResultSet(BTreeMap<String, InstanceOutcome>);

impl RunResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for an instance. Returns false and keeps the
    /// existing entry if the name was already recorded.
    pub fn record(&mut self, name: impl Into<String>, outcome: InstanceOutcome) -> bool {
        let name = name.into();
        if self.0.contains_key(&name) {
            return false;
        }
        self.0.insert(name, outcome);
        true
    }

    pub fn get(&self, name: &str) -> Option<&InstanceOutcome> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InstanceOutcome)> {
        self.0.iter()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &InstanceFailure)> {
        self.0
            .iter()
            .filter_map(|(name, outcome)| outcome.failure().map(|f| (name, f)))
    }

    /// True when every instance completed with exit code 0.
    pub fn all_succeeded(&self) -> bool {
        self.0
            .values()
            .all(|outcome| outcome.result().is_some_and(ExecutionResult::is_success))
    }
}

/// A finished run, as persisted to Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: RunResultSet,
}
