//! Structured lifecycle events for remediation runs.
//!
//! - Run-scoped spans via [`RunSpan`]
//! - `emit_*` functions for admission, phase changes, provider attempts,
//!   validations and terminal outcomes
//!
//! Events are emitted at `info!` level unless noted; filter with `CIMEND_LOG`.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::domain::analysis::ProviderAttemptRecord;
use crate::domain::attempt::Phase;
use crate::domain::outcome::RunOutcome;
use crate::domain::run::RunKey;
use crate::domain::validation::ValidationReport;

/// Span tagging everything one coordinator instance does with its run.
///
/// Coordinators run as tasks, so the span is attached with
/// [`RunSpan::in_run`] rather than held entered across awaits.
#[derive(Debug, Clone)]
pub struct RunSpan {
    span: tracing::Span,
}

impl RunSpan {
    pub fn new(key: &RunKey, attempt_id: Uuid) -> Self {
        let span = tracing::info_span!(
            "cimend.run",
            repo = %key.repo,
            run_id = key.run_id,
            attempt_id = %attempt_id,
        );
        Self { span }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn in_run<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

pub fn emit_run_admitted(key: &RunKey, attempt_id: Uuid) {
    info!(event = "run.admitted", run = %key, attempt_id = %attempt_id);
}

pub fn emit_run_duplicate(key: &RunKey) {
    info!(event = "run.duplicate", run = %key);
}

pub fn emit_phase_changed(key: &RunKey, from: Phase, to: Phase) {
    info!(event = "run.phase", run = %key, from = %from, to = %to);
}

/// Provider attempt finished. Failed attempts log at `warn!`.
pub fn emit_provider_attempt(key: &RunKey, record: &ProviderAttemptRecord) {
    if record.outcome.is_success() {
        info!(
            event = "provider.attempt",
            run = %key,
            provider = %record.provider,
            round = record.round,
            attempt = record.attempt,
            duration_ms = record.duration_ms,
            success = true,
        );
    } else {
        warn!(
            event = "provider.attempt",
            run = %key,
            provider = %record.provider,
            round = record.round,
            attempt = record.attempt,
            duration_ms = record.duration_ms,
            success = false,
            outcome = ?record.outcome,
        );
    }
}

pub fn emit_validation_finished(key: &RunKey, report: &ValidationReport) {
    info!(
        event = "validation.finished",
        run = %key,
        candidate = %report.candidate_id,
        passed = report.passed(),
        tests_passed = report.tests_passed,
        tests_failed = report.tests_failed,
        duration_ms = report.duration_ms,
    );
}

pub fn emit_run_finished(outcome: &RunOutcome) {
    let duration_ms = (outcome.finished_at - outcome.started_at)
        .num_milliseconds()
        .max(0);
    info!(
        event = "run.finished",
        run = %outcome.key,
        phase = %outcome.phase(),
        total_attempts = outcome.total_attempts,
        providers = %outcome.providers_tried.join(","),
        duration_ms = duration_ms,
        pull_request = outcome.pull_request.as_ref().map(|pr| pr.url.as_str()),
    );
}

/// Audit artifact could not be written (warning level).
pub fn emit_artifact_error(key: &RunKey, error: &dyn std::fmt::Display) {
    warn!(event = "run.artifact_error", run = %key, error = %error);
}
