//! Terminal outcomes of a remediation attempt and their human-readable summary.

use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::analysis::{AnalysisResult, AttemptOutcome, ProviderAttemptRecord};
use crate::domain::attempt::Phase;
use crate::domain::publish::PullRequestRecord;
use crate::domain::run::RunKey;
use crate::domain::validation::ValidationReport;

/// Why a run ended `Aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AbortReason {
    /// The run (or repository) does not exist or is not readable.
    NotFound { detail: String },
    /// Transient fetch errors persisted past the collector's retry budget.
    FetchExhausted { detail: String },
    /// Every configured provider failed to produce a usable candidate.
    ProvidersExhausted,
    /// Branch creation or commit conflicted twice.
    PublishConflict { detail: String },
    /// The credentials may not write to the repository.
    PermissionDenied { detail: String },
    /// The attempt was cancelled at a suspension point.
    Cancelled,
    /// Unexpected internal failure.
    Internal { detail: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NotFound { detail } => write!(f, "run not found: {detail}"),
            AbortReason::FetchExhausted { detail } => {
                write!(f, "could not fetch run after retries: {detail}")
            }
            AbortReason::ProvidersExhausted => {
                f.write_str("all providers exhausted without a usable fix")
            }
            AbortReason::PublishConflict { detail } => write!(f, "publish conflict: {detail}"),
            AbortReason::PermissionDenied { detail } => write!(f, "permission denied: {detail}"),
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

/// Terminal state of a coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Published,
    Exhausted,
    Aborted { reason: AbortReason },
}

impl TerminalState {
    pub fn phase(&self) -> Phase {
        match self {
            TerminalState::Published => Phase::Published,
            TerminalState::Exhausted => Phase::Exhausted,
            TerminalState::Aborted { .. } => Phase::Aborted,
        }
    }
}

/// Everything known about a finished remediation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub key: RunKey,
    pub state: TerminalState,
    pub providers_tried: Vec<String>,
    pub total_attempts: u32,
    pub analyses: Vec<AnalysisResult>,
    pub provider_attempts: Vec<ProviderAttemptRecord>,
    pub validations: Vec<ValidationReport>,
    pub pull_request: Option<PullRequestRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Markdown summary suitable for posting back to the run.
    pub summary: String,
}

impl RunOutcome {
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Render [`RunOutcome::summary`] from the other fields.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let headline = match &self.state {
            TerminalState::Published => "published a validated fix".to_string(),
            TerminalState::Exhausted => format!(
                "no passing fix after {} attempt(s)",
                self.total_attempts
            ),
            TerminalState::Aborted { reason } => format!("aborted: {reason}"),
        };
        let _ = writeln!(out, "### cimend: {} - {}", self.key, headline);

        if let Some(analysis) = self.analyses.last() {
            let _ = writeln!(
                out,
                "\n**Root cause** ({}, confidence {:.2}): {}",
                analysis.provider, analysis.confidence, analysis.root_cause
            );
        }

        if self.providers_tried.is_empty() {
            let _ = writeln!(out, "\n**Providers tried:** none");
        } else {
            let _ = writeln!(
                out,
                "\n**Providers tried:** {}",
                self.providers_tried.join(", ")
            );
        }

        if !self.provider_attempts.is_empty() {
            let _ = writeln!(out, "\n| round | provider | attempt | result |");
            let _ = writeln!(out, "|---|---|---|---|");
            for rec in &self.provider_attempts {
                let result = match &rec.outcome {
                    AttemptOutcome::Candidate { .. } => "candidate".to_string(),
                    AttemptOutcome::Timeout { limit_ms } => format!("timeout ({limit_ms}ms)"),
                    AttemptOutcome::ProviderError { message } => format!("error: {message}"),
                    AttemptOutcome::Unparsable { reason } => format!("unparsable: {reason}"),
                };
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} |",
                    rec.round,
                    rec.provider,
                    rec.attempt,
                    result.replace('|', "/")
                );
            }
        }

        if let Some(report) = self.validations.last() {
            let _ = writeln!(
                out,
                "\n**Final validation:** {:?} ({})",
                report.verdict,
                report.metrics_line()
            );
            if let Some(detail) = &report.detail {
                let _ = writeln!(out, "\n```\n{}\n```", detail);
            }
        }

        if let Some(pr) = &self.pull_request {
            let _ = writeln!(out, "\n**Pull request:** #{} {}", pr.number, pr.url);
        }

        out
    }
}
