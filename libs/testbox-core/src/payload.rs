//! Payload construction.
//!
//! A test function's source text becomes a standalone script that defines
//! the function and calls it. Framework markers are stripped with
//! caller-supplied patterns; nothing is stripped by default.

use crate::error::CoreError;
use regex::Regex;
use testbox_common::package::SourceText;

pub const PAYLOAD_SHEBANG: &str = "#!/usr/bin/env python3";
pub const REMOTE_PAYLOAD_PATH: &str = "/root/test";

/// Remove every match of each pattern from `src`.
///
/// Each pattern is applied until the text no longer matches (or stops
/// changing, for patterns that match the empty string), so removals that
/// splice a new match together are caught too.
pub fn strip_exclusions(src: &str, patterns: &[Regex]) -> String {
    let mut out = src.to_string();
    for pattern in patterns {
        while pattern.is_match(&out) {
            let next = pattern.replace_all(&out, "").into_owned();
            if next == out {
                break;
            }
            out = next;
        }
    }
    out
}

/// Standalone script: shebang, the stripped source, then `entry_name()`.
pub fn build_payload(function_source: &str, entry_name: &str, exclusion_patterns: &[Regex]) -> String {
    let src = strip_exclusions(function_source, exclusion_patterns);
    format!("{}\n{}\n{}()\n", PAYLOAD_SHEBANG, src, entry_name)
}

/// A user test function as supplied by the test-definition side.
#[derive(Debug, Clone)]
pub struct TestFunction {
    pub source: SourceText,
    pub entry: String,
    pub exclusions: Vec<String>,
}

impl TestFunction {
    pub fn new(source: SourceText, entry: impl Into<String>) -> Self {
        Self {
            source,
            entry: entry.into(),
            exclusions: Vec::new(),
        }
    }

    pub fn inline(source: impl Into<String>, entry: impl Into<String>) -> Self {
        Self::new(SourceText::Inline(source.into()), entry)
    }

    pub fn with_exclusions(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclusions = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Read the source and build the payload script.
    pub fn build(&self) -> Result<String, CoreError> {
        if self.entry.is_empty() {
            return Err(self.construction_error("entry point name is empty".to_string()));
        }

        let source = self
            .source
            .read()
            .map_err(|e| self.construction_error(format!("could not read source: {}", e)))?;

        let patterns = self
            .exclusions
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.construction_error(format!("invalid exclusion pattern: {}", e)))?;

        Ok(build_payload(&source, &self.entry, &patterns))
    }

    fn construction_error(&self, reason: String) -> CoreError {
        CoreError::PayloadConstruction {
            entry: self.entry.clone(),
            reason,
        }
    }
}
