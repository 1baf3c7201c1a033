//! Run coordinator: admission, worker pool and the per-run state machine.
//!
//! ```text
//! Collecting -> Classifying -> Proposing -> Validating -> (Refining -> Proposing)*
//!            -> Publishing -> {Published, Exhausted, Aborted}
//! ```
//!
//! `submit` admits a run into the [`AttemptRegistry`] and queues it without
//! blocking; a pool of workers drains the queue and drives one run each.
//! A global semaphore bounds how many runs are Proposing/Validating at once;
//! waiting for a slot blocks the worker, never the submitter.
//!
//! Every external call is a suspension point that also observes the run's
//! cancellation signal. Cancellation ends the run `Aborted(Cancelled)`;
//! in-flight sandbox workspaces are released by their lease.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::write_outcome_artifact;
use crate::classifier::{ClassifierConfig, FailureClassifier, PatternRule, PatternTable};
use crate::collector::{CollectError, FailureCollector};
use crate::domain::attempt::{AttemptState, Phase};
use crate::domain::fix::FixCandidate;
use crate::domain::outcome::{AbortReason, RunOutcome, TerminalState};
use crate::domain::publish::PullRequestRecord;
use crate::domain::run::{RepoRef, RunKey, WorkflowRun};
use crate::domain::signal::FailureSignal;
use crate::domain::validation::ValidationReport;
use crate::fix::{FixGenerator, FixPolicy};
use crate::metrics::METRICS;
use crate::obs::{
    emit_artifact_error, emit_phase_changed, emit_run_admitted, emit_run_duplicate,
    emit_run_finished, emit_validation_finished, RunSpan,
};
use crate::provider::{
    OrchestratorConfig, OrchestratorError, ProposalAudit, ProposalContext, Provider,
    ProviderCursor, ProviderOrchestrator,
};
use crate::publisher::{PublishError, PublisherConfig, PullRequestPublisher};
use crate::registry::{AdmissionTicket, AttemptRegistry};
use crate::retry::BackoffPolicy;
use crate::sandbox::{RepoSnapshot, SandboxRuntime, ValidationConfig, ValidationSandbox};
use crate::scm::{ScmSourceView, SourceControl};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What a refinement round does with the provider cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementPolicy {
    /// Re-prompt the provider that produced the failing candidate.
    #[default]
    SameProvider,
    /// Move to the next provider in priority order.
    NextProvider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Upper bound on Proposing -> Validating cycles per run.
    pub max_total_attempts: u32,
    /// Runs allowed in Proposing/Validating at the same time.
    pub max_concurrent_active: usize,
    /// Worker tasks draining the admission queue.
    pub workers: usize,
    /// Admitted runs waiting for a worker; `submit` rejects beyond this.
    pub queue_capacity: usize,
    pub refinement: RefinementPolicy,
    pub orchestrator: OrchestratorConfig,
    pub collector_backoff: BackoffPolicy,
    pub validation: ValidationConfig,
    pub publisher: PublisherConfig,
    pub fix: FixPolicy,
    pub classifier: ClassifierConfig,
    /// Rules appended after the builtin classifier table.
    pub extra_patterns: Vec<PatternRule>,
    /// Write `outcome.json` per finished run under this directory.
    pub artifacts_dir: Option<PathBuf>,
    /// Finished outcomes kept for [`RunCoordinator::status`].
    pub outcome_history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: 3,
            max_concurrent_active: 4,
            workers: 4,
            queue_capacity: 64,
            refinement: RefinementPolicy::default(),
            orchestrator: OrchestratorConfig::default(),
            collector_backoff: BackoffPolicy::default(),
            validation: ValidationConfig::default(),
            publisher: PublisherConfig::default(),
            fix: FixPolicy::default(),
            classifier: ClassifierConfig::default(),
            extra_patterns: Vec::new(),
            artifacts_dir: None,
            outcome_history: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        let invalid = |msg: &str| Err(CoordinatorError::InvalidConfig(msg.to_string()));
        if self.max_total_attempts == 0 {
            return invalid("max_total_attempts must be at least 1");
        }
        if self.max_concurrent_active == 0 {
            return invalid("max_concurrent_active must be at least 1");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.orchestrator.max_attempts_per_provider == 0 {
            return invalid("orchestrator.max_attempts_per_provider must be at least 1");
        }
        if self.orchestrator.call_timeout_ms == 0 {
            return invalid("orchestrator.call_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Concrete collaborators a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub scm: Arc<dyn SourceControl>,
    /// In priority order.
    pub providers: Vec<Arc<dyn Provider>>,
    pub sandbox: Arc<dyn SandboxRuntime>,
}

// ---------------------------------------------------------------------------
// Public results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid coordinator configuration: {0}")]
    InvalidConfig(String),

    #[error("an attempt for {0} is already in flight")]
    Duplicate(RunKey),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// Immediate answer to [`RunCoordinator::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitStatus {
    Accepted { attempt_id: Uuid },
    /// An attempt for the same run is in flight; nothing changed.
    Duplicate,
    Rejected { reason: String },
}

/// Answer to [`RunCoordinator::status`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    InFlight(AttemptState),
    Finished(Box<RunOutcome>),
    Unknown,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Bounded memory of finished runs, newest wins.
#[derive(Default)]
struct OutcomeHistory {
    by_key: HashMap<RunKey, RunOutcome>,
    order: VecDeque<RunKey>,
}

struct Shared {
    config: CoordinatorConfig,
    registry: AttemptRegistry,
    scm: Arc<dyn SourceControl>,
    collector: FailureCollector,
    classifier: FailureClassifier,
    orchestrator: ProviderOrchestrator,
    sandbox: ValidationSandbox,
    publisher: PullRequestPublisher,
    active_slots: Arc<Semaphore>,
    history: Mutex<OutcomeHistory>,
    outcomes: broadcast::Sender<RunOutcome>,
}

pub struct RunCoordinator {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::Sender<AdmissionTicket>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RunCoordinator {
    /// Build the pipeline and spawn the worker pool. Requires a Tokio runtime.
    pub fn start(
        config: CoordinatorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let table = PatternTable::default()
            .with_rules(&config.extra_patterns)
            .map_err(|e| CoordinatorError::InvalidConfig(format!("extra_patterns: {e}")))?;
        let sandbox = ValidationSandbox::new(collaborators.sandbox, config.validation.clone())
            .map_err(|e| CoordinatorError::InvalidConfig(e.to_string()))?;

        let (outcomes, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            registry: AttemptRegistry::new(),
            collector: FailureCollector::new(
                collaborators.scm.clone(),
                config.collector_backoff.clone(),
            ),
            classifier: FailureClassifier::new(table, config.classifier.clone()),
            orchestrator: ProviderOrchestrator::new(
                collaborators.providers,
                config.orchestrator.clone(),
                FixGenerator::new(config.fix.clone()),
            ),
            sandbox,
            publisher: PullRequestPublisher::new(
                collaborators.scm.clone(),
                config.publisher.clone(),
            ),
            scm: collaborators.scm,
            active_slots: Arc::new(Semaphore::new(config.max_concurrent_active)),
            history: Mutex::new(OutcomeHistory::default()),
            outcomes,
            config,
        });

        let (tx, rx) = mpsc::channel::<AdmissionTicket>(shared.config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..shared.config.workers)
            .map(|worker| {
                let shared = shared.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(ticket) = next else { break };
                        debug!(worker, run = %ticket.key, "picked up run");
                        shared.drive(ticket).await;
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        info!(
            workers = shared.config.workers,
            max_concurrent_active = shared.config.max_concurrent_active,
            providers = %shared.orchestrator.provider_names().join(","),
            "run coordinator started"
        );

        Ok(Self {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Admit and queue a run. Returns immediately.
    pub fn submit(&self, repo: &RepoRef, run_id: u64) -> SubmitStatus {
        let key = RunKey::new(repo.clone(), run_id);
        let Some(tx) = lock(&self.queue).clone() else {
            return SubmitStatus::Rejected {
                reason: CoordinatorError::ShuttingDown.to_string(),
            };
        };

        let Some(ticket) = self.shared.registry.try_admit(&key) else {
            METRICS.inc_duplicate();
            emit_run_duplicate(&key);
            return SubmitStatus::Duplicate;
        };
        let attempt_id = ticket.attempt_id;

        match tx.try_send(ticket) {
            Ok(()) => {
                METRICS.inc_admitted();
                emit_run_admitted(&key, attempt_id);
                SubmitStatus::Accepted { attempt_id }
            }
            Err(err) => {
                self.shared.registry.release(&key, attempt_id);
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "admission queue is full".to_string(),
                    mpsc::error::TrySendError::Closed(_) => {
                        CoordinatorError::ShuttingDown.to_string()
                    }
                };
                warn!(run = %key, %reason, "run rejected");
                SubmitStatus::Rejected { reason }
            }
        }
    }

    /// Admit a run and drive it on the calling task.
    pub async fn run_to_completion(
        &self,
        repo: &RepoRef,
        run_id: u64,
    ) -> Result<RunOutcome, CoordinatorError> {
        let key = RunKey::new(repo.clone(), run_id);
        let ticket = match self.shared.registry.try_admit(&key) {
            Some(ticket) => ticket,
            None => {
                METRICS.inc_duplicate();
                emit_run_duplicate(&key);
                return Err(CoordinatorError::Duplicate(key));
            }
        };
        METRICS.inc_admitted();
        emit_run_admitted(&key, ticket.attempt_id);
        Ok(self.shared.drive(ticket).await)
    }

    pub fn status(&self, repo: &RepoRef, run_id: u64) -> RunStatus {
        let key = RunKey::new(repo.clone(), run_id);
        if let Some(state) = self.shared.registry.snapshot(&key) {
            return RunStatus::InFlight(state);
        }
        match lock(&self.shared.history).by_key.get(&key) {
            Some(outcome) => RunStatus::Finished(Box::new(outcome.clone())),
            None => RunStatus::Unknown,
        }
    }

    /// All runs currently in flight.
    pub fn in_flight(&self) -> Vec<AttemptState> {
        self.shared.registry.in_flight()
    }

    /// Terminal outcomes, as they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<RunOutcome> {
        self.shared.outcomes.subscribe()
    }

    /// Cancel an in-flight or queued run. Returns `false` if none exists.
    pub fn cancel(&self, repo: &RepoRef, run_id: u64) -> bool {
        let key = RunKey::new(repo.clone(), run_id);
        let found = self.shared.registry.cancel(&key);
        if found {
            info!(run = %key, "cancellation requested");
        }
        found
    }

    /// Stop admitting, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        lock(&self.queue).take();
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("run coordinator stopped");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Per-run state machine
// ---------------------------------------------------------------------------

/// Audit data accumulated while one run is driven.
#[derive(Default)]
struct RunProgress {
    audit: ProposalAudit,
    validations: Vec<ValidationReport>,
    pull_request: Option<PullRequestRecord>,
    total_attempts: u32,
}

/// Run `fut` unless the run is cancelled first. `None` means cancelled.
async fn guarded<F: Future>(cancel: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    if *cancel.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        _ = cancelled(cancel) => None,
        out = fut => Some(out),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn aborted(reason: AbortReason) -> TerminalState {
    TerminalState::Aborted { reason }
}

impl Shared {
    async fn drive(&self, ticket: AdmissionTicket) -> RunOutcome {
        let span = RunSpan::new(&ticket.key, ticket.attempt_id);
        span.in_run(self.drive_inner(ticket)).await
    }

    async fn drive_inner(&self, ticket: AdmissionTicket) -> RunOutcome {
        let started_at = self
            .registry
            .snapshot(&ticket.key)
            .map(|s| s.started_at)
            .unwrap_or_else(Utc::now);
        let mut cancel = ticket.cancelled.clone();
        let mut progress = RunProgress::default();

        let state = self.pipeline(&ticket, &mut cancel, &mut progress).await;
        self.finish(&ticket, state, progress, started_at)
    }

    fn enter(&self, ticket: &AdmissionTicket, next: Phase) {
        if let Some(from) = self.registry.transition(&ticket.key, ticket.attempt_id, next) {
            emit_phase_changed(&ticket.key, from, next);
        }
    }

    fn note_providers(&self, ticket: &AdmissionTicket, audit: &ProposalAudit) {
        for provider in audit.providers_tried() {
            self.registry
                .note_provider(&ticket.key, ticket.attempt_id, &provider);
        }
    }

    async fn pipeline(
        &self,
        ticket: &AdmissionTicket,
        cancel: &mut watch::Receiver<bool>,
        progress: &mut RunProgress,
    ) -> TerminalState {
        let key = &ticket.key;

        // Collecting
        let run = match guarded(cancel, self.collector.collect(&key.repo, key.run_id)).await {
            None => return aborted(AbortReason::Cancelled),
            Some(Err(CollectError::NotFound(detail))) => {
                return aborted(AbortReason::NotFound { detail })
            }
            Some(Err(e @ CollectError::TransientFetchError { .. })) => {
                return aborted(AbortReason::FetchExhausted {
                    detail: e.to_string(),
                })
            }
            Some(Ok(run)) => run,
        };

        // Classifying
        self.enter(ticket, Phase::Classifying);
        let signals = self.classifier.classify(&run);
        debug!(signals = signals.len(), "classified failure");

        // Proposing / Validating / Refining
        let (candidate, report) = match self
            .propose_and_validate(ticket, &run, &signals, cancel, progress)
            .await
        {
            Ok(validated) => validated,
            Err(state) => return state,
        };

        // Publishing
        self.enter(ticket, Phase::Publishing);
        match guarded(cancel, self.publisher.publish(&candidate, &report, &run)).await {
            None => aborted(AbortReason::Cancelled),
            Some(Ok(record)) => {
                progress.pull_request = Some(record);
                TerminalState::Published
            }
            Some(Err(PublishError::Conflict(detail))) => {
                aborted(AbortReason::PublishConflict { detail })
            }
            Some(Err(PublishError::PermissionDenied(detail))) => {
                aborted(AbortReason::PermissionDenied { detail })
            }
            Some(Err(e)) => aborted(AbortReason::Internal {
                detail: e.to_string(),
            }),
        }
    }

    /// Loop Proposing -> Validating (-> Refining) until a candidate passes.
    async fn propose_and_validate(
        &self,
        ticket: &AdmissionTicket,
        run: &WorkflowRun,
        signals: &[FailureSignal],
        cancel: &mut watch::Receiver<bool>,
        progress: &mut RunProgress,
    ) -> Result<(FixCandidate, ValidationReport), TerminalState> {
        let key = &ticket.key;
        let view = ScmSourceView::new(
            self.scm.clone(),
            key.repo.clone(),
            run.trigger.head_sha.clone(),
        );
        let snapshot = RepoSnapshot {
            repo: key.repo.clone(),
            branch: run.trigger.head_branch.clone(),
            commit_sha: run.trigger.head_sha.clone(),
        };
        let mut cursor = ProviderCursor::default();
        let mut previous: Option<ValidationReport> = None;

        loop {
            let round = progress.total_attempts + 1;
            let permit = match guarded(cancel, self.active_slots.clone().acquire_owned()).await {
                None => return Err(aborted(AbortReason::Cancelled)),
                Some(Err(_closed)) => {
                    return Err(aborted(AbortReason::Internal {
                        detail: "concurrency limiter closed".into(),
                    }))
                }
                Some(Ok(permit)) => permit,
            };
            // Entered only once a slot is held, so waiting runs are not counted as active.
            self.enter(ticket, Phase::Proposing);

            let ctx = ProposalContext {
                run,
                signals,
                previous: previous.as_ref(),
                round,
            };
            let proposed = guarded(
                cancel,
                self.orchestrator
                    .analyze_and_propose(ctx, &mut cursor, &view, &mut progress.audit),
            )
            .await;
            self.note_providers(ticket, &progress.audit);

            let candidate = match proposed {
                None => return Err(aborted(AbortReason::Cancelled)),
                Some(Err(OrchestratorError::AllProvidersExhausted { .. }))
                | Some(Err(OrchestratorError::NoProviders)) => {
                    return Err(aborted(AbortReason::ProvidersExhausted))
                }
                Some(Ok(candidate)) => candidate,
            };

            self.enter(ticket, Phase::Validating);
            progress.total_attempts = self
                .registry
                .increment_attempts(key, ticket.attempt_id)
                .unwrap_or(round);

            let report =
                match guarded(cancel, self.sandbox.validate(&candidate, &snapshot)).await {
                    None => return Err(aborted(AbortReason::Cancelled)),
                    Some(report) => report,
                };
            drop(permit);

            METRICS.record_validation(report.passed());
            emit_validation_finished(key, &report);
            progress.validations.push(report.clone());

            if report.passed() {
                return Ok((candidate, report));
            }
            if progress.total_attempts >= self.config.max_total_attempts {
                return Err(TerminalState::Exhausted);
            }

            self.enter(ticket, Phase::Refining);
            if self.config.refinement == RefinementPolicy::NextProvider {
                cursor.advance();
            }
            previous = Some(report);
        }
    }

    fn finish(
        &self,
        ticket: &AdmissionTicket,
        state: TerminalState,
        progress: RunProgress,
        started_at: chrono::DateTime<Utc>,
    ) -> RunOutcome {
        self.enter(ticket, state.phase());

        let mut outcome = RunOutcome {
            key: ticket.key.clone(),
            state,
            providers_tried: progress.audit.providers_tried(),
            total_attempts: progress.total_attempts,
            analyses: progress.audit.analyses,
            provider_attempts: progress.audit.attempts,
            validations: progress.validations,
            pull_request: progress.pull_request,
            started_at,
            finished_at: Utc::now(),
            summary: String::new(),
        };
        outcome.summary = outcome.render_summary();

        match &outcome.state {
            TerminalState::Published => METRICS.inc_published(),
            TerminalState::Exhausted => METRICS.inc_exhausted(),
            TerminalState::Aborted { .. } => METRICS.inc_aborted(),
        }

        if let Some(dir) = &self.config.artifacts_dir {
            if let Err(e) = write_outcome_artifact(&outcome, dir) {
                emit_artifact_error(&outcome.key, &e);
            }
        }

        // Record before releasing so `status` never reports Unknown in between.
        {
            let mut history = lock(&self.history);
            if history
                .by_key
                .insert(outcome.key.clone(), outcome.clone())
                .is_none()
            {
                history.order.push_back(outcome.key.clone());
            }
            while history.order.len() > self.config.outcome_history.max(1) {
                if let Some(old) = history.order.pop_front() {
                    history.by_key.remove(&old);
                }
            }
        }
        self.registry.release(&ticket.key, ticket.attempt_id);

        emit_run_finished(&outcome);
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome.clone());
        outcome
    }
}
