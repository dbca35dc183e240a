/// Result Aggregator - Backend-Agnostic Outcome Shaping
///
/// **Core Responsibility:**
/// Turn raw backend captures into `ExecutionResult`s and collect per-instance
/// outcomes into a run summary.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about lifecycle states
/// - Pure functions: (raw capture) → result, (result set) → summary
///
/// **Decoding Rules:**
/// - Streams are decoded as UTF-8, invalid bytes replaced
/// - A stream the backend did not capture stays `None`
/// - A missing exit code stays `None`; it is not guessed

use crate::backend::RawExecution;
use crate::error::InstanceError;
use serde::Serialize;
use testbox_common::types::{ExecutionResult, InstanceOutcome, RunResultSet};

/// Shape a raw capture into an `ExecutionResult`
pub fn process(raw: RawExecution) -> ExecutionResult {
    ExecutionResult {
        exit_code: raw.exit_code,
        stdout: raw.stdout.map(|b| String::from_utf8_lossy(&b).into_owned()),
        stderr: raw.stderr.map(|b| String::from_utf8_lossy(&b).into_owned()),
    }
}

/// Outcome recorded for an instance whose pipeline finished (or aborted)
pub fn outcome(result: Result<ExecutionResult, InstanceError>) -> InstanceOutcome {
    match result {
        Ok(result) => InstanceOutcome::Completed(result),
        Err(e) => InstanceOutcome::Failed(e.to_failure()),
    }
}

/// Counts over a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    /// Payload ran and exited 0
    pub succeeded: usize,
    /// Payload ran but exited non-zero (or without an exit code)
    pub nonzero_exit: usize,
    /// Pipeline aborted before the payload finished
    pub failed: usize,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.succeeded == self.total
    }
}

/// Aggregate a result set into counts
pub fn summarize(results: &RunResultSet) -> RunSummary {
    let mut summary = RunSummary::default();
    for (_, outcome) in results.iter() {
        summary.total += 1;
        match outcome {
            InstanceOutcome::Completed(result) if result.is_success() => summary.succeeded += 1,
            InstanceOutcome::Completed(_) => summary.nonzero_exit += 1,
            InstanceOutcome::Failed(_) => summary.failed += 1,
        }
    }
    summary
}
