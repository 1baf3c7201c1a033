//! Priority-ordered fallback and retry across providers.
//!
//! Providers are tried strictly in configuration order. A provider is retried
//! (with backoff) until it has failed `max_attempts_per_provider` times, then
//! the cursor moves to the next one. Timeouts, transport errors and replies
//! the fix generator cannot materialize all count as failures. The first
//! invocation that yields a candidate ends the round.
//!
//! The [`ProviderCursor`] lives in the caller across rounds so refinement
//! continues where the previous round stopped instead of restarting at the
//! top of the list.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::analysis::{AnalysisResult, AttemptOutcome, ProviderAttemptRecord};
use crate::domain::fix::FixCandidate;
use crate::domain::run::WorkflowRun;
use crate::domain::signal::FailureSignal;
use crate::domain::validation::ValidationReport;
use crate::fix::{FixError, FixGenerator};
use crate::metrics::METRICS;
use crate::obs::emit_provider_attempt;
use crate::retry::BackoffPolicy;
use crate::scm::SourceView;

use super::error::{OrchestratorError, ProviderError};
use super::prompt::build_prompt;
use super::{ProposalRequest, Provider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Failed invocations tolerated per provider before falling back.
    pub max_attempts_per_provider: u32,
    /// Bound on one provider invocation (milliseconds).
    pub call_timeout_ms: u64,
    /// Delay between retries of the same provider. `max_attempts` is unused.
    pub retry_backoff: BackoffPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_provider: 2,
            call_timeout_ms: 120_000,
            retry_backoff: BackoffPolicy {
                base_delay_ms: 500,
                factor: 2,
                max_attempts: 1,
                max_delay_ms: 10_000,
            },
        }
    }
}

/// Position in the provider list, carried across coordinator rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCursor {
    pub index: usize,
    /// Failed invocations of the provider at `index`.
    pub failures_on_current: u32,
    /// Invocations of the provider at `index`, failed or not.
    pub calls_on_current: u32,
}

impl ProviderCursor {
    /// Move to the next provider in priority order.
    pub fn advance(&mut self) {
        self.index += 1;
        self.failures_on_current = 0;
        self.calls_on_current = 0;
    }
}

/// Inputs for one proposal round.
#[derive(Debug, Clone, Copy)]
pub struct ProposalContext<'a> {
    pub run: &'a WorkflowRun,
    pub signals: &'a [FailureSignal],
    /// Failing report of the previous round, if refining.
    pub previous: Option<&'a ValidationReport>,
    /// Coordinator round (1-based).
    pub round: u32,
}

/// Audit trail accumulated across rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalAudit {
    pub analyses: Vec<AnalysisResult>,
    pub attempts: Vec<ProviderAttemptRecord>,
}

impl ProposalAudit {
    /// Distinct provider names in first-invocation order.
    pub fn providers_tried(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for a in &self.attempts {
            if !seen.contains(&a.provider) {
                seen.push(a.provider.clone());
            }
        }
        seen
    }
}

pub struct ProviderOrchestrator {
    providers: Vec<Arc<dyn Provider>>,
    config: OrchestratorConfig,
    generator: FixGenerator,
}

impl ProviderOrchestrator {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        config: OrchestratorConfig,
        generator: FixGenerator,
    ) -> Self {
        Self {
            providers,
            config,
            generator,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Produce one fix candidate, falling back across providers from `cursor`.
    ///
    /// Every invocation is appended to `audit`, including the analysis of
    /// replies whose edits were rejected.
    #[instrument(skip_all, fields(run = %ctx.run.key, round = ctx.round))]
    pub async fn analyze_and_propose(
        &self,
        ctx: ProposalContext<'_>,
        cursor: &mut ProviderCursor,
        source: &dyn SourceView,
        audit: &mut ProposalAudit,
    ) -> Result<FixCandidate, OrchestratorError> {
        if self.providers.is_empty() {
            return Err(OrchestratorError::NoProviders);
        }

        let max_failures = self.config.max_attempts_per_provider.max(1);
        let limit_ms = self.config.call_timeout_ms;
        let prompt = build_prompt(
            ctx.run,
            ctx.signals,
            ctx.previous,
            &self.generator.policy().protected_globs,
        );

        while let Some(provider) = self.providers.get(cursor.index) {
            if cursor.failures_on_current >= max_failures {
                debug!(provider = provider.name(), "attempt cap reached, falling back");
                cursor.advance();
                continue;
            }

            cursor.calls_on_current += 1;
            let request = ProposalRequest {
                run: ctx.run.key.clone(),
                prompt: prompt.clone(),
                signals: ctx.signals.to_vec(),
                previous: ctx.previous.cloned(),
                round: ctx.round,
                attempt: cursor.calls_on_current,
            };

            let started = Instant::now();
            let called = tokio::time::timeout(
                Duration::from_millis(limit_ms),
                provider.propose(&request),
            )
            .await;

            let outcome = match called {
                Err(_elapsed) => Err(AttemptOutcome::Timeout { limit_ms }),
                Ok(Err(ProviderError::Timeout { limit_ms })) => {
                    Err(AttemptOutcome::Timeout { limit_ms })
                }
                Ok(Err(ProviderError::MalformedResponse(reason))) => {
                    Err(AttemptOutcome::Unparsable { reason })
                }
                Ok(Err(e)) => Err(AttemptOutcome::ProviderError {
                    message: e.to_string(),
                }),
                Ok(Ok(reply)) => {
                    let analysis = reply.into_analysis(provider.name());
                    audit.analyses.push(analysis.clone());
                    match self.generator.materialize(&analysis, source).await {
                        Ok(candidate) => Ok(candidate),
                        Err(e) => Err(unusable(e)),
                    }
                }
            };

            let record = ProviderAttemptRecord {
                provider: provider.name().to_string(),
                attempt: request.attempt,
                round: ctx.round,
                outcome: match &outcome {
                    Ok(candidate) => AttemptOutcome::Candidate {
                        candidate_id: candidate.id,
                    },
                    Err(failed) => failed.clone(),
                },
                duration_ms: started.elapsed().as_millis() as u64,
                at: Utc::now(),
            };
            emit_provider_attempt(&ctx.run.key, &record);
            METRICS.record_provider_call(outcome.is_err());
            audit.attempts.push(record);

            match outcome {
                Ok(candidate) => return Ok(candidate),
                Err(_) => {
                    cursor.failures_on_current += 1;
                    if cursor.failures_on_current >= max_failures {
                        warn!(
                            provider = provider.name(),
                            failures = cursor.failures_on_current,
                            "provider exhausted, falling back"
                        );
                        cursor.advance();
                    } else {
                        let delay = self
                            .config
                            .retry_backoff
                            .delay_for(cursor.failures_on_current);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(OrchestratorError::AllProvidersExhausted {
            tried: audit.providers_tried(),
        })
    }
}

fn unusable(err: FixError) -> AttemptOutcome {
    AttemptOutcome::Unparsable {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::ProposedEdit;
    use crate::domain::run::{Conclusion, RepoRef, RunKey, TriggerInfo};
    use crate::fakes::{CallJournal, MapSourceView, ScriptedProvider};
    use crate::provider::ProviderReply;

    fn run() -> WorkflowRun {
        WorkflowRun {
            key: RunKey::new(RepoRef::new("acme", "widgets"), 9),
            workflow_name: "ci".into(),
            trigger: TriggerInfo {
                event: "push".into(),
                head_branch: "main".into(),
                head_sha: "abc".into(),
                actor: None,
            },
            conclusion: Conclusion::Failure,
            jobs: vec![],
            fetched_at: Utc::now(),
        }
    }

    fn good_reply() -> ProviderReply {
        ProviderReply {
            root_cause: "typo".into(),
            confidence: 0.8,
            remediation_steps: vec![],
            edits: vec![ProposedEdit::replace_in("src/lib.rs", "retrun", "return")],
        }
    }

    fn source() -> MapSourceView {
        MapSourceView::from_pairs([("src/lib.rs", "fn f() -> u8 { retrun 1; }\n")])
    }

    fn orchestrator(providers: Vec<Arc<dyn Provider>>) -> ProviderOrchestrator {
        let config = OrchestratorConfig {
            call_timeout_ms: 1_000,
            ..Default::default()
        };
        ProviderOrchestrator::new(providers, config, FixGenerator::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_after_attempt_cap() {
        let journal = CallJournal::default();
        let first = ScriptedProvider::new("first")
            .with_journal(journal.clone())
            .hang()
            .hang();
        let second = ScriptedProvider::new("second")
            .with_journal(journal.clone())
            .reply(good_reply());
        let orch = orchestrator(vec![Arc::new(first), Arc::new(second)]);

        let run = run();
        let mut cursor = ProviderCursor::default();
        let mut audit = ProposalAudit::default();
        let ctx = ProposalContext {
            run: &run,
            signals: &[],
            previous: None,
            round: 1,
        };
        let candidate = orch
            .analyze_and_propose(ctx, &mut cursor, &source(), &mut audit)
            .await
            .unwrap();

        assert_eq!(candidate.analysis.provider, "second");
        assert_eq!(journal.calls(), vec!["first", "first", "second"]);
        assert_eq!(audit.attempts.len(), 3);
        assert!(matches!(
            audit.attempts[0].outcome,
            AttemptOutcome::Timeout { limit_ms: 1_000 }
        ));
        assert_eq!(audit.attempts[1].attempt, 2);
        assert_eq!(cursor.index, 1);
        assert_eq!(audit.providers_tried(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsable_reply_counts_as_failure() {
        let bad = ProviderReply {
            edits: vec![ProposedEdit::replace_in("src/lib.rs", "nope", "x")],
            ..good_reply()
        };
        let only = ScriptedProvider::new("only").reply(bad.clone()).reply(bad);
        let orch = orchestrator(vec![Arc::new(only)]);

        let run = run();
        let mut cursor = ProviderCursor::default();
        let mut audit = ProposalAudit::default();
        let ctx = ProposalContext {
            run: &run,
            signals: &[],
            previous: None,
            round: 1,
        };
        let err = orch
            .analyze_and_propose(ctx, &mut cursor, &source(), &mut audit)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            OrchestratorError::AllProvidersExhausted {
                tried: vec!["only".into()]
            }
        );
        assert_eq!(audit.analyses.len(), 2, "rejected analyses are retained");
        assert!(audit
            .attempts
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::Unparsable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_resumes_on_next_round() {
        let primary = ScriptedProvider::new("primary")
            .error(ProviderError::Transport("reset".into()))
            .reply(good_reply())
            .reply(good_reply());
        let orch = orchestrator(vec![Arc::new(primary)]);

        let run = run();
        let mut cursor = ProviderCursor::default();
        let mut audit = ProposalAudit::default();
        for round in 1..=2 {
            let ctx = ProposalContext {
                run: &run,
                signals: &[],
                previous: None,
                round,
            };
            orch.analyze_and_propose(ctx, &mut cursor, &source(), &mut audit)
                .await
                .unwrap();
        }
        // One failure then two successes; failure count survives the round.
        assert_eq!(cursor.failures_on_current, 1);
        assert_eq!(audit.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let orch = orchestrator(vec![]);
        let run = run();
        let ctx = ProposalContext {
            run: &run,
            signals: &[],
            previous: None,
            round: 1,
        };
        let err = orch
            .analyze_and_propose(
                ctx,
                &mut ProviderCursor::default(),
                &source(),
                &mut ProposalAudit::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::NoProviders);
    }
}
