//! Shared deterministic types for the supervisor core.
//!
//! These types are the contracts passed between the scanner, detention,
//! release, and pacing stages. They carry no I/O handles.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One full cycle of agent invocation, tool execution, scanning, and pacing.
///
/// Created at the top of the loop and finalized after scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-indexed ordinal within the current session.
    pub ordinal: u64,
    /// RFC 3339 local timestamp of when the iteration started.
    pub started_at: String,
    /// Model reported by the provider (empty until the first reply arrives).
    pub model: String,
    /// Assistant text accumulated across every round.
    pub output_text: String,
    /// Rendered tool inputs, one line per call. Scanned alongside `output_text`.
    pub tool_transcript: String,
    pub tool_calls: u32,
    pub success: bool,
    /// Failure message when `success` is false.
    pub error: Option<String>,
    /// `git log --oneline` entries created during the iteration.
    pub new_commits: Vec<String>,
    /// Paths changed relative to the HEAD at iteration start.
    pub changed_files: Vec<String>,
    /// Violation descriptions found by the scan pass.
    pub violations: Vec<String>,
}

impl Iteration {
    pub fn new(ordinal: u64, started_at: impl Into<String>) -> Self {
        Self {
            ordinal,
            started_at: started_at.into(),
            model: String::new(),
            output_text: String::new(),
            tool_transcript: String::new(),
            tool_calls: 0,
            success: false,
            error: None,
            new_commits: Vec::new(),
            changed_files: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Text the violation scanner inspects.
    pub fn scan_text(&self) -> String {
        let mut text = String::with_capacity(self.output_text.len() + self.tool_transcript.len() + 1);
        text.push_str(&self.output_text);
        text.push('\n');
        text.push_str(&self.tool_transcript);
        text
    }
}

/// A single policy violation found by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation(pub String);

impl Violation {
    pub fn new(description: impl Into<String>) -> Self {
        Self(description.into())
    }

    pub fn description(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `[RELEASE:<path>]` directive parsed from iteration text. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    /// Path as written by the agent (relative to the workspace, or absolute under it).
    pub source: String,
    pub target_branch: String,
    pub iteration: u64,
}

/// How the rest interval before the next iteration was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingKind {
    /// `[SLEEP:<n>]`, with the requested value before clamping.
    Explicit { requested_secs: u64 },
    /// `[SKIP_SLEEP]`.
    Skip,
    /// No directive present.
    Default,
    /// The iteration failed; directives are ignored.
    FailureCooldown,
}

/// Resolved rest interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingDirective {
    pub kind: PacingKind,
    pub wait: Duration,
}

/// Reason why the supervisor loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Workspace disk usage exceeded the configured quota.
    QuotaExceeded { used_mb: u64, limit_mb: u64 },
    /// Too many consecutive failed iterations.
    ErrorBudgetExhausted { consecutive_errors: u32 },
    /// The operator interrupted the process.
    Interrupted,
    /// `--max-iterations` was reached.
    IterationLimit { iterations: u64 },
}

impl StopReason {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StopReason::QuotaExceeded { .. } | StopReason::ErrorBudgetExhausted { .. }
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::QuotaExceeded { used_mb, limit_mb } => {
                write!(f, "quota exceeded ({used_mb}MB used, limit {limit_mb}MB)")
            }
            StopReason::ErrorBudgetExhausted { consecutive_errors } => {
                write!(f, "error budget exhausted ({consecutive_errors} consecutive errors)")
            }
            StopReason::Interrupted => f.write_str("operator interrupt"),
            StopReason::IterationLimit { iterations } => {
                write!(f, "iteration limit reached ({iterations})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_text_includes_tool_transcript() {
        let mut iteration = Iteration::new(1, "2026-01-01T00:00:00+00:00");
        iteration.output_text = "thinking".to_string();
        iteration.tool_transcript = "run_command: ls".to_string();
        let text = iteration.scan_text();
        assert!(text.contains("thinking"));
        assert!(text.contains("run_command: ls"));
    }

    #[test]
    fn only_quota_and_error_budget_are_fatal() {
        assert!(StopReason::QuotaExceeded { used_mb: 2, limit_mb: 1 }.is_fatal());
        assert!(StopReason::ErrorBudgetExhausted { consecutive_errors: 5 }.is_fatal());
        assert!(!StopReason::Interrupted.is_fatal());
        assert!(!StopReason::IterationLimit { iterations: 3 }.is_fatal());
    }
}
