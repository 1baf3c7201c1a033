//! Validation driver: apply a candidate in a fresh workspace, build, test.
//!
//! Every failure, including sandbox infrastructure errors, becomes a failing
//! [`ValidationReport`]. The whole validation runs against one wall-clock
//! deadline; hitting it is reported as [`FailureDetail::Timeout`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::fix::FixCandidate;
use crate::domain::validation::{FailureDetail, ValidationReport, Verdict};

use super::error::{SandboxError, SandboxResult};
use super::report::{parse_coverage, parse_test_counts, tail_lines, DEFAULT_COVERAGE_REGEX};
use super::runtime::{CommandSpec, RepoSnapshot, SandboxRuntime, WorkspaceHandle, WorkspaceLease};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Run in order; the first non-zero exit fails the build.
    pub build_commands: Vec<String>,
    /// Run in order after a successful build.
    pub test_commands: Vec<String>,
    /// Hard wall-clock limit for one whole validation.
    pub timeout_secs: u64,
    /// Regex whose first capture group is a coverage percentage.
    pub coverage_regex: String,
    /// Lines of output kept in the report.
    pub log_tail_lines: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            build_commands: vec!["cargo build --all-targets".to_string()],
            test_commands: vec!["cargo test".to_string()],
            timeout_secs: 900,
            coverage_regex: DEFAULT_COVERAGE_REGEX.to_string(),
            log_tail_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Build,
    Test,
}

/// Accumulated results while a validation runs.
#[derive(Default)]
struct Progress {
    log: String,
    test_output: String,
    tests_passed: u32,
    tests_failed: u32,
}

pub struct ValidationSandbox {
    runtime: Arc<dyn SandboxRuntime>,
    config: ValidationConfig,
    coverage: Regex,
}

impl ValidationSandbox {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: ValidationConfig) -> SandboxResult<Self> {
        if config.timeout_secs == 0 {
            return Err(SandboxError::InvalidConfig(
                "timeout_secs must be greater than zero".into(),
            ));
        }
        let coverage = Regex::new(&config.coverage_regex)
            .map_err(|e| SandboxError::InvalidConfig(format!("coverage_regex: {e}")))?;
        Ok(Self {
            runtime,
            config,
            coverage,
        })
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate `candidate` against `snapshot`. Never fails; errors become a
    /// failing report.
    #[instrument(skip_all, fields(candidate = %candidate.id, repo = %snapshot.repo))]
    pub async fn validate(
        &self,
        candidate: &FixCandidate,
        snapshot: &RepoSnapshot,
    ) -> ValidationReport {
        let started = Instant::now();
        let mut progress = Progress::default();
        let detail = self.run_stages(candidate, snapshot, &mut progress).await;

        let coverage_percent = parse_coverage(&self.coverage, &progress.test_output);
        let verdict = if detail.is_none() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        ValidationReport {
            candidate_id: candidate.id,
            candidate_digest: candidate.digest.clone(),
            verdict,
            detail,
            build_log: tail_lines(&progress.log, self.config.log_tail_lines),
            tests_passed: progress.tests_passed,
            tests_failed: progress.tests_failed,
            coverage_percent,
            duration_ms: started.elapsed().as_millis() as u64,
            validated_at: Utc::now(),
        }
    }

    async fn run_stages(
        &self,
        candidate: &FixCandidate,
        snapshot: &RepoSnapshot,
        progress: &mut Progress,
    ) -> Option<FailureDetail> {
        match candidate.verify_digest() {
            Ok(true) => {}
            Ok(false) => {
                return Some(FailureDetail::ApplyFailed {
                    reason: "candidate edits do not match their digest".into(),
                })
            }
            Err(e) => {
                return Some(FailureDetail::ApplyFailed {
                    reason: e.to_string(),
                })
            }
        }

        let limit_secs = self.config.timeout_secs;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(limit_secs);
        let timed_out = |during: &str| FailureDetail::Timeout {
            limit_secs,
            during: during.to_string(),
        };

        let handle =
            match tokio::time::timeout_at(deadline, self.runtime.acquire_workspace(snapshot)).await
            {
                Err(_) => return Some(timed_out("workspace acquisition")),
                Ok(Err(e)) => {
                    return Some(FailureDetail::Infrastructure {
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(handle)) => handle,
            };
        let lease = WorkspaceLease::new(self.runtime.clone(), handle.clone());

        let detail = self.run_in_workspace(candidate, &handle, deadline, progress).await;

        if let Err(e) = lease.release().await {
            warn!(error = %e, "workspace release failed");
            if detail.is_none() {
                return Some(FailureDetail::Infrastructure {
                    reason: e.to_string(),
                });
            }
        }
        detail
    }

    async fn run_in_workspace(
        &self,
        candidate: &FixCandidate,
        handle: &WorkspaceHandle,
        deadline: tokio::time::Instant,
        progress: &mut Progress,
    ) -> Option<FailureDetail> {
        let limit_secs = self.config.timeout_secs;
        let timed_out = |during: &str| FailureDetail::Timeout {
            limit_secs,
            during: during.to_string(),
        };

        match tokio::time::timeout_at(deadline, self.runtime.apply_edits(handle, &candidate.edits))
            .await
        {
            Err(_) => return Some(timed_out("applying edits")),
            Ok(Err(e)) => {
                return Some(FailureDetail::ApplyFailed {
                    reason: e.to_string(),
                })
            }
            Ok(Ok(())) => {}
        }

        let stages = self
            .config
            .build_commands
            .iter()
            .map(|c| (Stage::Build, c))
            .chain(self.config.test_commands.iter().map(|c| (Stage::Test, c)));

        for (stage, command) in stages {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let spec = CommandSpec {
                command: command.clone(),
                timeout_secs: remaining.as_secs().max(1),
            };
            debug!(command = %command, ?stage, "running");

            let output = match tokio::time::timeout_at(
                deadline,
                self.runtime.run_command(handle, &spec),
            )
            .await
            {
                Err(_) | Ok(Err(SandboxError::Timeout { .. })) => return Some(timed_out(command)),
                Ok(Err(e)) => {
                    return Some(FailureDetail::Infrastructure {
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(output)) => output,
            };

            progress.log.push_str(&format!("$ {command}\n"));
            progress.log.push_str(&output.output);
            if !output.output.ends_with('\n') {
                progress.log.push('\n');
            }

            let exit_code = output.exit_code.unwrap_or(-1);
            let output_tail = tail_lines(&output.output, self.config.log_tail_lines);
            match stage {
                Stage::Build => {
                    if !output.success() {
                        return Some(FailureDetail::BuildFailed {
                            command: command.clone(),
                            exit_code,
                            output_tail,
                        });
                    }
                }
                Stage::Test => {
                    progress.test_output.push_str(&output.output);
                    progress.test_output.push('\n');
                    let counts = parse_test_counts(&output.output).unwrap_or_default();
                    progress.tests_passed += counts.passed;
                    progress.tests_failed += counts.failed;
                    if !output.success() || counts.failed > 0 {
                        return Some(FailureDetail::TestsFailed {
                            command: command.clone(),
                            exit_code,
                            output_tail,
                        });
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::AnalysisResult;
    use crate::domain::fix::{EditKind, FileEdit};
    use crate::domain::run::RepoRef;
    use crate::fakes::{ScriptedSandbox, SandboxStep};

    fn candidate() -> FixCandidate {
        FixCandidate::new(
            vec![FileEdit::write("src/lib.rs", EditKind::Modify, "fn ok() {}")],
            "fix".into(),
            AnalysisResult::new("p", "cause"),
        )
        .unwrap()
    }

    fn snapshot() -> RepoSnapshot {
        RepoSnapshot {
            repo: RepoRef::new("acme", "widgets"),
            branch: "main".into(),
            commit_sha: "abc".into(),
        }
    }

    fn sandbox(runtime: Arc<ScriptedSandbox>) -> ValidationSandbox {
        ValidationSandbox::new(runtime, ValidationConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_passing_validation_collects_counts() {
        let runtime = Arc::new(
            ScriptedSandbox::new()
                .then(SandboxStep::exit(0, "Finished dev"))
                .then(SandboxStep::exit(
                    0,
                    "test result: ok. 12 passed; 0 failed; 0 ignored\ncoverage: 77.5%",
                )),
        );
        let report = sandbox(runtime.clone()).validate(&candidate(), &snapshot()).await;

        assert!(report.passed(), "{:?}", report.detail);
        assert_eq!(report.tests_passed, 12);
        assert_eq!(report.coverage_percent, Some(77.5));
        assert_eq!(report.candidate_digest, candidate().digest);
        assert_eq!(runtime.released(), 1);
        assert_eq!(runtime.applied_paths(), vec!["src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_build_failure_skips_tests() {
        let runtime = Arc::new(ScriptedSandbox::new().then(SandboxStep::exit(101, "error[E0308]")));
        let report = sandbox(runtime.clone()).validate(&candidate(), &snapshot()).await;

        assert!(matches!(
            report.detail,
            Some(FailureDetail::BuildFailed { exit_code: 101, .. })
        ));
        assert_eq!(runtime.commands_run(), vec!["cargo build --all-targets"]);
        assert_eq!(runtime.released(), 1);
    }

    #[tokio::test]
    async fn test_failed_tests_are_distinct_from_timeout() {
        let runtime = Arc::new(
            ScriptedSandbox::new()
                .then(SandboxStep::exit(0, ""))
                .then(SandboxStep::exit(
                    101,
                    "test result: FAILED. 3 passed; 2 failed; 0 ignored",
                )),
        );
        let report = sandbox(runtime).validate(&candidate(), &snapshot()).await;
        assert!(matches!(report.detail, Some(FailureDetail::TestsFailed { .. })));
        assert_eq!(report.tests_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_reported_and_workspace_released() {
        let runtime = Arc::new(ScriptedSandbox::new().then(SandboxStep::Hang));
        let config = ValidationConfig {
            timeout_secs: 5,
            ..Default::default()
        };
        let sandbox = ValidationSandbox::new(runtime.clone(), config).unwrap();
        let report = sandbox.validate(&candidate(), &snapshot()).await;

        assert_eq!(
            report.detail,
            Some(FailureDetail::Timeout {
                limit_secs: 5,
                during: "cargo build --all-targets".into()
            })
        );
        assert_eq!(runtime.released(), 1);
    }

    #[tokio::test]
    async fn test_acquire_failure_is_a_failing_report() {
        let runtime = Arc::new(ScriptedSandbox::new().fail_acquire("no capacity"));
        let report = sandbox(runtime.clone()).validate(&candidate(), &snapshot()).await;
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(matches!(report.detail, Some(FailureDetail::Infrastructure { .. })));
        assert_eq!(runtime.released(), 0);
    }

    #[tokio::test]
    async fn test_tampered_candidate_is_not_applied() {
        let mut c = candidate();
        c.edits.push(FileEdit::delete("Cargo.toml"));
        let runtime = Arc::new(ScriptedSandbox::new());
        let report = sandbox(runtime.clone()).validate(&c, &snapshot()).await;
        assert!(matches!(report.detail, Some(FailureDetail::ApplyFailed { .. })));
        assert!(runtime.applied_paths().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let runtime = Arc::new(ScriptedSandbox::new());
        let bad = ValidationConfig {
            coverage_regex: "(".into(),
            ..Default::default()
        };
        assert!(matches!(
            ValidationSandbox::new(runtime, bad),
            Err(SandboxError::InvalidConfig(_))
        ));
    }
}
