//! Validation reports produced by the sandbox for each fix candidate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pass/fail verdict of one validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Why a validation failed. Fed back into refinement prompts, so each
/// variant must read distinctly to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureDetail {
    /// The edits could not be applied to the workspace.
    ApplyFailed { reason: String },
    /// A build command exited non-zero.
    BuildFailed { command: String, exit_code: i32, output_tail: String },
    /// A test command exited non-zero.
    TestsFailed { command: String, exit_code: i32, output_tail: String },
    /// The validation exceeded its wall-clock limit.
    Timeout { limit_secs: u64, during: String },
    /// Sandbox acquisition or execution infrastructure failed.
    Infrastructure { reason: String },
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureDetail::ApplyFailed { reason } => {
                write!(f, "the patch could not be applied: {reason}")
            }
            FailureDetail::BuildFailed {
                command,
                exit_code,
                output_tail,
            } => write!(
                f,
                "the build failed (`{command}` exited {exit_code}):\n{output_tail}"
            ),
            FailureDetail::TestsFailed {
                command,
                exit_code,
                output_tail,
            } => write!(
                f,
                "tests failed (`{command}` exited {exit_code}):\n{output_tail}"
            ),
            FailureDetail::Timeout { limit_secs, during } => write!(
                f,
                "the fix timed out after {limit_secs}s while running `{during}`"
            ),
            FailureDetail::Infrastructure { reason } => {
                write!(f, "the validation sandbox failed: {reason}")
            }
        }
    }
}

/// Outcome of validating one fix candidate. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub candidate_id: Uuid,
    /// Digest of the exact edits that were validated.
    pub candidate_digest: String,
    pub verdict: Verdict,
    pub detail: Option<FailureDetail>,
    /// Tail of the combined build/test output.
    pub build_log: String,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub coverage_percent: Option<f64>,
    pub duration_ms: u64,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Whether this report is a passing verdict for the given digest.
    pub fn approves(&self, candidate_digest: &str) -> bool {
        self.passed() && self.candidate_digest == candidate_digest
    }

    /// One-line metrics summary.
    pub fn metrics_line(&self) -> String {
        let coverage = self
            .coverage_percent
            .map(|c| format!("{c:.1}%"))
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "tests passed: {}, failed: {}, coverage: {}, duration: {}ms",
            self.tests_passed, self.tests_failed, coverage, self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(verdict: Verdict) -> ValidationReport {
        ValidationReport {
            candidate_id: Uuid::new_v4(),
            candidate_digest: "abc".into(),
            verdict,
            detail: None,
            build_log: String::new(),
            tests_passed: 10,
            tests_failed: 0,
            coverage_percent: Some(81.25),
            duration_ms: 1200,
            validated_at: Utc::now(),
        }
    }

    #[test]
    fn test_approves_requires_pass_and_matching_digest() {
        assert!(report(Verdict::Pass).approves("abc"));
        assert!(!report(Verdict::Pass).approves("abd"));
        assert!(!report(Verdict::Fail).approves("abc"));
    }

    #[test]
    fn test_timeout_reads_differently_from_test_failure() {
        let timeout = FailureDetail::Timeout {
            limit_secs: 600,
            during: "cargo test".into(),
        };
        let tests = FailureDetail::TestsFailed {
            command: "cargo test".into(),
            exit_code: 101,
            output_tail: "1 failed".into(),
        };
        assert!(timeout.to_string().contains("timed out"));
        assert!(tests.to_string().starts_with("tests failed"));
    }

    #[test]
    fn test_metrics_line() {
        let line = report(Verdict::Pass).metrics_line();
        assert!(line.contains("coverage: 81.2%") || line.contains("coverage: 81.3%"));
        assert!(line.contains("passed: 10"));
    }
}
