//! End-to-end coordinator tests against the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use cimend_core::fakes::{
    CallJournal, MemorySourceControl, ProviderStep, SandboxStep, ScriptedProvider,
    ScriptedSandbox,
};
use cimend_core::{
    read_outcome_artifact, AbortReason, AttemptOutcome, BackoffPolicy, Collaborators,
    CoordinatorConfig, CoordinatorError, OrchestratorConfig, Phase, ProposedEdit, Provider,
    ProviderError, ProviderReply, RefinementPolicy, RepoRef, RunCoordinator, RunOutcome,
    RunStatus, ScmError, SubmitStatus, TerminalState,
};

const LOG: &str = "\
   Compiling widgets v0.1.0
error[E0425]: cannot find value `cnt` in this scope
 --> src/lib.rs:2:5
  |
2 |     cnt + 1
  |     ^^^ not found in this scope
error: could not compile `widgets` due to 1 previous error
";

const LIB_RS: &str = "pub fn total(count: u32) -> u32 {\n    cnt + 1\n}\n";

fn repo() -> RepoRef {
    RepoRef::new("acme", "widgets")
}

fn scm_with_runs(ids: &[u64]) -> MemorySourceControl {
    ids.iter()
        .fold(MemorySourceControl::new(), |scm, id| {
            scm.with_failed_run(&repo(), *id, LOG)
        })
        .with_file(&repo(), "src/lib.rs", LIB_RS)
}

fn fix_reply() -> ProviderReply {
    ProviderReply {
        root_cause: "`cnt` is a typo for the `count` parameter".into(),
        confidence: 0.9,
        remediation_steps: vec!["rename cnt to count".into()],
        edits: vec![ProposedEdit::replace_in("src/lib.rs", "cnt + 1", "count + 1")],
    }
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        collector_backoff: BackoffPolicy::none(),
        orchestrator: OrchestratorConfig {
            max_attempts_per_provider: 2,
            call_timeout_ms: 1_000,
            retry_backoff: BackoffPolicy {
                base_delay_ms: 10,
                factor: 2,
                max_attempts: 3,
                max_delay_ms: 100,
            },
        },
        ..Default::default()
    }
}

struct Harness {
    coordinator: RunCoordinator,
    scm: Arc<MemorySourceControl>,
    sandbox: Arc<ScriptedSandbox>,
}

fn start(
    config: CoordinatorConfig,
    scm: MemorySourceControl,
    providers: Vec<Arc<ScriptedProvider>>,
    sandbox: ScriptedSandbox,
) -> Harness {
    let scm = Arc::new(scm);
    let sandbox = Arc::new(sandbox);
    let collaborators = Collaborators {
        scm: scm.clone(),
        providers: providers
            .into_iter()
            .map(|p| p as Arc<dyn Provider>)
            .collect(),
        sandbox: sandbox.clone(),
    };
    let coordinator = RunCoordinator::start(config, collaborators).expect("valid config");
    Harness {
        coordinator,
        scm,
        sandbox,
    }
}

async fn wait_for_phase(coordinator: &RunCoordinator, run_id: u64, phase: Phase) {
    for _ in 0..500 {
        if let RunStatus::InFlight(state) = coordinator.status(&repo(), run_id) {
            if state.phase == phase {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached {phase}");
}

async fn next_outcome(rx: &mut tokio::sync::broadcast::Receiver<RunOutcome>) -> RunOutcome {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("outcome in time")
        .expect("channel open")
}

// ---------------------------------------------------------------------------
// Core scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_single_compile_error_is_published() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()));
    let h = start(
        config(),
        scm_with_runs(&[100]),
        vec![alpha.clone()],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h
        .coordinator
        .run_to_completion(&repo(), 100)
        .await
        .expect("admitted");

    assert_eq!(outcome.state, TerminalState::Published);
    assert_eq!(outcome.analyses.len(), 1);
    assert_eq!(outcome.validations.len(), 1);
    assert!(outcome.validations[0].passed());
    assert_eq!(outcome.total_attempts, 1);
    assert_eq!(outcome.providers_tried, vec!["alpha"]);

    let pr = outcome.pull_request.expect("pull request recorded");
    assert_eq!(pr.run.run_id, 100);
    assert_eq!(pr.candidate_digest, outcome.validations[0].candidate_digest);

    let commits = h.scm.commits();
    assert_eq!(commits.len(), 1);
    let content = commits[0].edits[0].content.as_deref().unwrap_or_default();
    assert!(content.contains("count + 1"));
    assert_eq!(h.scm.pull_requests().len(), 1);

    let prompt = &alpha.requests()[0].prompt;
    assert!(prompt.contains("cannot find value `cnt`"));
    assert!(matches!(
        h.coordinator.status(&repo(), 100),
        RunStatus::Finished(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_fall_back_to_next_provider() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").hang().hang());
    let beta = Arc::new(ScriptedProvider::new("beta").reply(fix_reply()));
    let h = start(
        config(),
        scm_with_runs(&[101]),
        vec![alpha.clone(), beta.clone()],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 101).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Published);
    assert_eq!(outcome.providers_tried, vec!["alpha", "beta"]);
    assert_eq!(alpha.calls(), 2);
    assert_eq!(beta.calls(), 1);

    let alpha_attempts: Vec<_> = outcome
        .provider_attempts
        .iter()
        .filter(|a| a.provider == "alpha")
        .collect();
    assert_eq!(alpha_attempts.len(), 2);
    assert!(alpha_attempts
        .iter()
        .all(|a| matches!(a.outcome, AttemptOutcome::Timeout { limit_ms: 1_000 })));
    assert_eq!(outcome.analyses.len(), 1);
    assert_eq!(outcome.analyses[0].provider, "beta");
}

#[tokio::test(start_paused = true)]
async fn test_attempt_cap_of_one_exhausts_without_publishing() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()));
    let h = start(
        CoordinatorConfig {
            max_total_attempts: 1,
            ..config()
        },
        scm_with_runs(&[102]),
        vec![alpha.clone()],
        ScriptedSandbox::new().failing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 102).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Exhausted);
    assert_eq!(outcome.total_attempts, 1);
    assert_eq!(outcome.validations.len(), 1);
    assert!(outcome.pull_request.is_none());
    assert!(h.scm.commits().is_empty());
    assert!(h.scm.pull_requests().is_empty());
    assert_eq!(alpha.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_run_aborts_before_any_provider() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()));
    let h = start(
        config(),
        MemorySourceControl::new(),
        vec![alpha.clone()],
        ScriptedSandbox::new(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 404).await.unwrap();

    assert!(matches!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::NotFound { .. }
        }
    ));
    assert_eq!(alpha.calls(), 0);
    assert_eq!(h.scm.fetch_run_calls(), 1);
    assert!(outcome.provider_attempts.is_empty());
    assert!(h.sandbox.commands_run().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_transient_fetch_errors_abort() {
    let h = start(
        CoordinatorConfig {
            collector_backoff: BackoffPolicy {
                base_delay_ms: 10,
                factor: 2,
                max_attempts: 2,
                max_delay_ms: 50,
            },
            ..config()
        },
        scm_with_runs(&[103])
            .fail_fetch_run(ScmError::Transient("502".into()))
            .fail_fetch_run(ScmError::Transient("502".into())),
        vec![Arc::new(ScriptedProvider::new("alpha"))],
        ScriptedSandbox::new(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 103).await.unwrap();

    assert!(matches!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::FetchExhausted { .. }
        }
    ));
    assert_eq!(h.scm.fetch_run_calls(), 2);
}

// ---------------------------------------------------------------------------
// Provider ordering and refinement
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_providers_tried_in_priority_order() {
    let journal = CallJournal::default();
    let alpha = Arc::new(
        ScriptedProvider::new("alpha")
            .with_journal(journal.clone())
            .error(ProviderError::Transport("reset".into()))
            .error(ProviderError::Transport("reset".into())),
    );
    let beta = Arc::new(
        ScriptedProvider::new("beta")
            .with_journal(journal.clone())
            .error(ProviderError::MalformedResponse("no json".into()))
            .error(ProviderError::MalformedResponse("no json".into())),
    );
    let gamma = Arc::new(
        ScriptedProvider::new("gamma")
            .with_journal(journal.clone())
            .reply(fix_reply()),
    );
    let h = start(
        config(),
        scm_with_runs(&[110]),
        vec![alpha, beta, gamma],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 110).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Published);
    assert_eq!(journal.calls(), vec!["alpha", "alpha", "beta", "beta", "gamma"]);
    assert_eq!(outcome.providers_tried, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_exhausted_aborts() {
    let alpha = Arc::new(
        ScriptedProvider::new("alpha")
            .error(ProviderError::Api {
                status: 500,
                message: "boom".into(),
            })
            .error(ProviderError::Api {
                status: 500,
                message: "boom".into(),
            }),
    );
    let h = start(
        config(),
        scm_with_runs(&[111]),
        vec![alpha],
        ScriptedSandbox::new(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 111).await.unwrap();

    assert_eq!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::ProvidersExhausted
        }
    );
    assert!(outcome.validations.is_empty());
    assert!(h.sandbox.commands_run().is_empty());
    assert!(h.scm.pull_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refinement_feeds_failure_back_to_same_provider() {
    let alpha = Arc::new(
        ScriptedProvider::new("alpha")
            .reply(fix_reply())
            .reply(fix_reply()),
    );
    let h = start(
        config(),
        scm_with_runs(&[120]),
        vec![alpha.clone()],
        ScriptedSandbox::new()
            .failing_validation()
            .passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 120).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Published);
    assert_eq!(outcome.total_attempts, 2);
    assert_eq!(outcome.validations.len(), 2);
    assert!(!outcome.validations[0].passed());

    let requests = alpha.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].previous.is_none());
    assert_eq!(requests[1].round, 2);
    assert!(requests[1].previous.is_some());
    assert!(requests[1].prompt.contains("tests failed"));
}

#[tokio::test(start_paused = true)]
async fn test_next_provider_refinement_moves_on() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()));
    let beta = Arc::new(ScriptedProvider::new("beta").reply(fix_reply()));
    let h = start(
        CoordinatorConfig {
            refinement: RefinementPolicy::NextProvider,
            ..config()
        },
        scm_with_runs(&[121]),
        vec![alpha.clone(), beta.clone()],
        ScriptedSandbox::new()
            .failing_validation()
            .passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 121).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Published);
    assert_eq!(alpha.calls(), 1);
    assert_eq!(beta.calls(), 1);
    assert_eq!(outcome.providers_tried, vec!["alpha", "beta"]);
}

#[tokio::test(start_paused = true)]
async fn test_next_provider_refinement_past_last_provider_aborts() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()));
    let h = start(
        CoordinatorConfig {
            refinement: RefinementPolicy::NextProvider,
            ..config()
        },
        scm_with_runs(&[122]),
        vec![alpha],
        ScriptedSandbox::new().failing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 122).await.unwrap();

    assert_eq!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::ProvidersExhausted
        }
    );
    assert_eq!(outcome.total_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_cap_bounds_validation_cycles() {
    let alpha = Arc::new(
        ScriptedProvider::new("alpha")
            .reply(fix_reply())
            .reply(fix_reply())
            .reply(fix_reply()),
    );
    let h = start(
        CoordinatorConfig {
            max_total_attempts: 2,
            ..config()
        },
        scm_with_runs(&[123]),
        vec![alpha.clone()],
        ScriptedSandbox::new()
            .failing_validation()
            .failing_validation()
            .passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 123).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Exhausted);
    assert_eq!(outcome.total_attempts, 2);
    assert_eq!(outcome.validations.len(), 2);
    assert_eq!(alpha.calls(), 2);
    assert_eq!(h.sandbox.commands_run().len(), 4);
    assert!(h.scm.pull_requests().is_empty());
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_publish_conflict_retried_once_then_aborts() {
    let h = start(
        config(),
        scm_with_runs(&[130])
            .fail_create_branch(ScmError::Conflict("exists".into()))
            .fail_create_branch(ScmError::Conflict("exists".into())),
        vec![Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()))],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 130).await.unwrap();

    assert!(matches!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::PublishConflict { .. }
        }
    ));
    assert!(outcome.pull_request.is_none());
    assert_eq!(outcome.validations.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_publish_conflict_recovers() {
    let h = start(
        config(),
        scm_with_runs(&[131]).fail_create_branch(ScmError::Conflict("exists".into())),
        vec![Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()))],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 131).await.unwrap();

    assert_eq!(outcome.state, TerminalState::Published);
    assert_eq!(h.scm.pull_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_on_publish_aborts() {
    let h = start(
        config(),
        scm_with_runs(&[132]).fail_open_pull_request(ScmError::PermissionDenied("403".into())),
        vec![Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()))],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 132).await.unwrap();

    assert!(matches!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::PermissionDenied { .. }
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_outcome_artifact_written() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(
        CoordinatorConfig {
            artifacts_dir: Some(dir.path().to_path_buf()),
            ..config()
        },
        scm_with_runs(&[140]),
        vec![Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()))],
        ScriptedSandbox::new().passing_validation(),
    );

    let outcome = h.coordinator.run_to_completion(&repo(), 140).await.unwrap();

    let stored = read_outcome_artifact(&outcome.key, dir.path()).expect("artifact");
    assert_eq!(stored, outcome);
    assert!(stored.summary.contains("published"));
}

// ---------------------------------------------------------------------------
// Admission, concurrency and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_submission_leaves_state_untouched() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").hang());
    let mut cfg = config();
    cfg.orchestrator.call_timeout_ms = 60_000;
    let h = start(
        cfg,
        scm_with_runs(&[150]),
        vec![alpha],
        ScriptedSandbox::new(),
    );

    assert!(matches!(
        h.coordinator.submit(&repo(), 150),
        SubmitStatus::Accepted { .. }
    ));
    wait_for_phase(&h.coordinator, 150, Phase::Proposing).await;
    let before = h.coordinator.status(&repo(), 150);

    assert_eq!(h.coordinator.submit(&repo(), 150), SubmitStatus::Duplicate);
    assert!(matches!(
        h.coordinator.run_to_completion(&repo(), 150).await,
        Err(CoordinatorError::Duplicate(_))
    ));
    assert_eq!(h.coordinator.status(&repo(), 150), before);

    h.coordinator.cancel(&repo(), 150);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_cancellation_aborts_and_releases_workspace() {
    let h = start(
        config(),
        scm_with_runs(&[160]),
        vec![Arc::new(ScriptedProvider::new("alpha").reply(fix_reply()))],
        ScriptedSandbox::new().then(SandboxStep::Hang),
    );
    let mut outcomes = h.coordinator.subscribe();

    assert!(matches!(
        h.coordinator.submit(&repo(), 160),
        SubmitStatus::Accepted { .. }
    ));
    wait_for_phase(&h.coordinator, 160, Phase::Validating).await;
    assert!(h.coordinator.cancel(&repo(), 160));

    let outcome = next_outcome(&mut outcomes).await;
    assert_eq!(
        outcome.state,
        TerminalState::Aborted {
            reason: AbortReason::Cancelled
        }
    );
    assert!(outcome.pull_request.is_none());

    for _ in 0..200 {
        if h.sandbox.released() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.sandbox.released(), 1);
    assert!(!h.coordinator.cancel(&repo(), 160), "no longer in flight");
    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_active_runs_bounded_by_concurrency_cap() {
    let delayed = |code: i32, out: &str| {
        SandboxStep::Delayed(Duration::from_millis(50), Box::new(SandboxStep::exit(code, out)))
    };
    let sandbox = (0..3).fold(ScriptedSandbox::new(), |s, _| {
        s.then(delayed(0, "Finished dev profile"))
            .then(delayed(0, "test result: ok. 5 passed; 0 failed"))
    });
    let alpha = (0..3).fold(ScriptedProvider::new("alpha"), |p, _| {
        p.then(ProviderStep::Delayed(
            Duration::from_millis(20),
            Box::new(ProviderStep::Reply(fix_reply())),
        ))
    });
    let h = start(
        CoordinatorConfig {
            max_concurrent_active: 1,
            workers: 3,
            ..config()
        },
        scm_with_runs(&[170, 171, 172]),
        vec![Arc::new(alpha)],
        sandbox,
    );
    let mut outcomes = h.coordinator.subscribe();

    for id in [170, 171, 172] {
        assert!(matches!(
            h.coordinator.submit(&repo(), id),
            SubmitStatus::Accepted { .. }
        ));
    }
    for _ in 0..3 {
        let outcome = next_outcome(&mut outcomes).await;
        assert_eq!(outcome.state, TerminalState::Published);
    }

    assert_eq!(h.sandbox.peak_active(), 1);
    assert_eq!(h.sandbox.released(), 3);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_run_waiting_for_a_slot_is_not_reported_active() {
    let alpha = Arc::new(ScriptedProvider::new("alpha").hang().hang());
    let mut cfg = CoordinatorConfig {
        max_concurrent_active: 1,
        workers: 2,
        ..config()
    };
    cfg.orchestrator.call_timeout_ms = 60_000;
    let h = start(cfg, scm_with_runs(&[190, 191]), vec![alpha], ScriptedSandbox::new());

    for id in [190, 191] {
        assert!(matches!(
            h.coordinator.submit(&repo(), id),
            SubmitStatus::Accepted { .. }
        ));
    }

    let mut phases = Vec::new();
    for _ in 0..500 {
        phases = h
            .coordinator
            .in_flight()
            .into_iter()
            .map(|s| s.phase)
            .collect::<Vec<_>>();
        phases.sort_by_key(|p| p.to_string());
        if phases == vec![Phase::Classifying, Phase::Proposing] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(phases, vec![Phase::Classifying, Phase::Proposing]);

    // Stays that way while the slot is held.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let proposing = h
        .coordinator
        .in_flight()
        .iter()
        .filter(|s| s.phase == Phase::Proposing)
        .count();
    assert_eq!(proposing, 1);

    h.coordinator.cancel(&repo(), 190);
    h.coordinator.cancel(&repo(), 191);
    h.coordinator.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let h = start(
        config(),
        scm_with_runs(&[180]),
        vec![Arc::new(ScriptedProvider::new("alpha"))],
        ScriptedSandbox::new(),
    );
    h.coordinator.shutdown().await;

    assert!(matches!(
        h.coordinator.submit(&repo(), 180),
        SubmitStatus::Rejected { .. }
    ));
    assert_eq!(h.coordinator.status(&repo(), 180), RunStatus::Unknown);
}

#[tokio::test]
async fn test_invalid_config_refused() {
    let err = RunCoordinator::start(
        CoordinatorConfig {
            max_total_attempts: 0,
            ..config()
        },
        Collaborators {
            scm: Arc::new(MemorySourceControl::new()),
            providers: vec![],
            sandbox: Arc::new(ScriptedSandbox::new()),
        },
    )
    .err()
    .expect("rejected");
    assert!(matches!(err, CoordinatorError::InvalidConfig(_)));
}
