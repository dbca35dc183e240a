use crate::types::Environment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Text supplied ahead of time, either inline or from a file on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceText {
    Inline(String),
    File(PathBuf),
}

impl SourceText {
    pub fn read(&self) -> io::Result<String> {
        match self {
            SourceText::Inline(text) => Ok(text.clone()),
            SourceText::File(path) => fs::read_to_string(path),
        }
    }

    /// Resolve relative file paths against `base`.
    pub fn rebase(&mut self, base: &Path) {
        if let SourceText::File(path) = self {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

/// Package kind tag. Selects how installer output feeds the environment.
///
/// Any tag not listed here parses to `Other` and has no side effects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PackageKind {
    /// Installer prints a JSON object; its entries become variables.
    Charmlib,
    /// Installer prints `KEY=VALUE` lines.
    EnvFile,
    Pip,
    Other(String),
}

impl From<String> for PackageKind {
    fn from(tag: String) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "charmlib" => PackageKind::Charmlib,
            "env_file" | "envfile" => PackageKind::EnvFile,
            "pip" => PackageKind::Pip,
            _ => PackageKind::Other(tag),
        }
    }
}

impl From<PackageKind> for String {
    fn from(kind: PackageKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Charmlib => write!(f, "charmlib"),
            PackageKind::EnvFile => write!(f, "env_file"),
            PackageKind::Pip => write!(f, "pip"),
            PackageKind::Other(tag) => write!(f, "{}", tag),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind} installer produced malformed output: {reason}")]
pub struct MalformedOutput {
    pub kind: String,
    pub reason: String,
}

impl PackageKind {
    /// Merge installer stdout into `env` according to this kind.
    ///
    /// Returns the number of variables written. Kinds without side effects
    /// return 0 without looking at the output.
    pub fn merge_side_effects(
        &self,
        stdout: &str,
        env: &mut Environment,
    ) -> Result<usize, MalformedOutput> {
        match self {
            PackageKind::Charmlib => self.merge_json(stdout, env),
            PackageKind::EnvFile => self.merge_key_values(stdout, env),
            PackageKind::Pip | PackageKind::Other(_) => Ok(0),
        }
    }

    fn merge_json(&self, stdout: &str, env: &mut Environment) -> Result<usize, MalformedOutput> {
        let value: serde_json::Value =
            serde_json::from_str(stdout.trim()).map_err(|e| self.malformed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| self.malformed("expected a JSON object".to_string()))?;

        for (key, value) in object {
            match value {
                serde_json::Value::String(s) => env.add(key.clone(), s.clone()),
                other => env.add(key.clone(), other.to_string()),
            }
        }
        Ok(object.len())
    }

    fn merge_key_values(
        &self,
        stdout: &str,
        env: &mut Environment,
    ) -> Result<usize, MalformedOutput> {
        let mut count = 0;
        for (lineno, line) in stdout.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| self.malformed(format!("line {} has no '='", lineno + 1)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(self.malformed(format!("line {} has an empty key", lineno + 1)));
            }
            env.add(key, value.trim());
            count += 1;
        }
        Ok(count)
    }

    fn malformed(&self, reason: String) -> MalformedOutput {
        MalformedOutput {
            kind: self.to_string(),
            reason,
        }
    }
}

/// Loader shipped inside the installer script.
///
/// `class` names the type whose `_load(path, hash)` is invoked remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderRef {
    pub class: String,
    pub source: SourceText,
}

/// A dependency bundle to install before the payload runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageRef {
    pub path: PathBuf,
    /// sha256 of the bundle, lowercase hex
    pub hash: String,
    pub kind: PackageKind,
    pub loader: LoaderRef,
}

impl PackageRef {
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupHook {
    #[serde(default)]
    pub packages: Vec<PackageRef>,
}
