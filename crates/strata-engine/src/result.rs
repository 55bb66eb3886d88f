//! Per-node run results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_adapter::AdapterResponse;
use strata_core::{Diagnostic, DiagnosticCode, Severity};

use crate::state::SkipReason;

/// Final status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Skipped,
    /// Data test returned no failing rows
    Pass,
    /// Data test returned failing rows
    Fail,
    /// Data test returned failing rows at warn severity
    Warn,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Warn => "warn",
        }
    }

    /// Whether dependents of a node with this status are skipped
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Error | Self::Fail | Self::Skipped)
    }

    /// Whether this status makes the invocation fail
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Fail)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed phase of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingInfo {
    /// Phase name (`compile` or `execute`)
    pub name: String,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,
}

impl TimingInfo {
    pub fn new(name: impl Into<String>, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            started_at,
            completed_at,
        }
    }
}

/// Outcome of one node in an execution pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub unique_id: String,

    pub status: RunStatus,

    pub timing: Vec<TimingInfo>,

    /// Worker slot the node ran on, e.g. `Thread-2`
    pub thread_id: String,

    /// Seconds spent executing
    pub execution_time: f64,

    pub message: Option<String>,

    pub adapter_response: Option<AdapterResponse>,

    /// Failing rows reported by a data test
    pub failures: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl RunResult {
    /// Result for a node that was never dispatched
    pub fn skipped(unique_id: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            unique_id: unique_id.into(),
            status: RunStatus::Skipped,
            timing: Vec::new(),
            thread_id: "main".to_string(),
            execution_time: 0.0,
            message: Some(reason.to_string()),
            adapter_response: None,
            failures: None,
            skip_reason: Some(reason),
        }
    }

    /// Result for a node that failed before dispatch
    ///
    /// The failure is stamped as a zero-length `compile` phase.
    pub fn errored(unique_id: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            unique_id: unique_id.into(),
            status: RunStatus::Error,
            timing: vec![TimingInfo::new("compile", now, now)],
            thread_id: "main".to_string(),
            execution_time: 0.0,
            message: Some(message.into()),
            adapter_response: None,
            failures: None,
            skip_reason: None,
        }
    }

    /// Diagnostic for a failed node
    pub fn to_diagnostic(&self) -> Option<Diagnostic> {
        let message = self.message.clone().unwrap_or_default();
        let diagnostic = match self.status {
            RunStatus::Error => Diagnostic::error(DiagnosticCode::ExecutionError, message),
            RunStatus::Fail => Diagnostic::error(DiagnosticCode::TestFailure, message),
            RunStatus::Warn => Diagnostic::new(DiagnosticCode::TestFailure, Severity::Warn, message),
            _ => return None,
        };
        Some(diagnostic.for_node(&self.unique_id))
    }
}

/// Everything one execution pass produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// Results in completion order
    pub results: Vec<RunResult>,

    /// Ancestors of the selection that were not executed
    pub referenced: Vec<String>,

    pub elapsed: Duration,

    pub interrupted: bool,

    pub timed_out: bool,
}

impl RunOutcome {
    pub fn result(&self, unique_id: &str) -> Option<&RunResult> {
        self.results.iter().find(|r| r.unique_id == unique_id)
    }

    pub fn status(&self, unique_id: &str) -> Option<RunStatus> {
        self.result(unique_id).map(|r| r.status)
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status.is_failure())
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Results ordered by unique id
    pub fn sorted_results(&self) -> Vec<&RunResult> {
        let mut results: Vec<&RunResult> = self.results.iter().collect();
        results.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        results
    }
}
