//! Pull request publisher: commit a validated candidate and open a PR.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::domain::fix::{EditKind, FixCandidate};
use crate::domain::publish::PullRequestRecord;
use crate::domain::run::{short_sha, WorkflowRun};
use crate::domain::validation::ValidationReport;
use crate::scm::{PullRequestDraft, ScmError, SourceControl};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// No passing report exists for this exact candidate.
    #[error("refusing to publish unvalidated candidate {candidate}")]
    Unvalidated { candidate: String },

    /// Branch collision or concurrent modification, after the one retry.
    #[error("publish conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("publish failed: {0}")]
    Scm(ScmError),
}

impl From<ScmError> for PublishError {
    fn from(err: ScmError) -> Self {
        match err {
            ScmError::Conflict(d) => PublishError::Conflict(d),
            ScmError::PermissionDenied(d) => PublishError::PermissionDenied(d),
            other => PublishError::Scm(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Branch names are `<prefix>/run-<id>-<digest>`.
    pub branch_prefix: String,
    /// Open pull requests as drafts.
    pub draft: bool,
    /// Target branch; defaults to the failed run's head branch.
    pub base_branch: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "cimend/fix".to_string(),
            draft: false,
            base_branch: None,
        }
    }
}

pub struct PullRequestPublisher {
    scm: Arc<dyn SourceControl>,
    config: PublisherConfig,
}

impl PullRequestPublisher {
    pub fn new(scm: Arc<dyn SourceControl>, config: PublisherConfig) -> Self {
        Self { scm, config }
    }

    fn branch_name(&self, run: &WorkflowRun, candidate: &FixCandidate, retry: bool) -> String {
        let base = format!(
            "{}/run-{}-{}",
            self.config.branch_prefix.trim_end_matches('/'),
            run.key.run_id,
            candidate.short_digest()
        );
        if retry {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{base}-{}", &suffix[..6])
        } else {
            base
        }
    }

    /// Publish `candidate`. Refuses unless `report` is a passing verdict for
    /// the candidate's digest and the digest still matches its edits.
    #[instrument(skip_all, fields(run = %run.key, candidate = %candidate.id))]
    pub async fn publish(
        &self,
        candidate: &FixCandidate,
        report: &ValidationReport,
        run: &WorkflowRun,
    ) -> Result<PullRequestRecord, PublishError> {
        let intact = candidate.verify_digest().unwrap_or(false);
        if !intact || !report.approves(&candidate.digest) || report.candidate_id != candidate.id {
            return Err(PublishError::Unvalidated {
                candidate: candidate.id.to_string(),
            });
        }

        match self.publish_once(candidate, report, run, false).await {
            Err(PublishError::Conflict(detail)) => {
                warn!(%detail, "publish conflict, retrying with a fresh branch");
                self.publish_once(candidate, report, run, true).await
            }
            other => other,
        }
    }

    async fn publish_once(
        &self,
        candidate: &FixCandidate,
        report: &ValidationReport,
        run: &WorkflowRun,
        retry: bool,
    ) -> Result<PullRequestRecord, PublishError> {
        let repo = &run.key.repo;
        let base = self
            .config
            .base_branch
            .clone()
            .unwrap_or_else(|| run.trigger.head_branch.clone());
        let branch = self.branch_name(run, candidate, retry);

        // Edits are whole-file contents resolved and validated at the run's head commit.
        let validated_sha = run.trigger.head_sha.as_str();
        let tip = self.scm.branch_tip(repo, &base).await?;
        let moved_to = (tip != validated_sha).then_some(tip);
        if let Some(tip) = &moved_to {
            warn!(
                base = %base,
                tip = %short_sha(tip),
                validated = %short_sha(validated_sha),
                "base moved since the failed run, branching from the validated commit"
            );
        }

        self.scm.create_branch(repo, &branch, validated_sha).await?;
        let published = self
            .commit_and_open(candidate, report, run, &base, &branch, moved_to.as_deref())
            .await;
        if published.is_err() {
            if let Err(e) = self.scm.delete_branch(repo, &branch).await {
                warn!(branch = %branch, error = %e, "could not delete abandoned fix branch");
            }
        }
        published
    }

    async fn commit_and_open(
        &self,
        candidate: &FixCandidate,
        report: &ValidationReport,
        run: &WorkflowRun,
        base: &str,
        branch: &str,
        moved_to: Option<&str>,
    ) -> Result<PullRequestRecord, PublishError> {
        let repo = &run.key.repo;
        let message = commit_message(candidate, run);
        let commit_sha = self
            .scm
            .commit(repo, branch, &run.trigger.head_sha, &message, &candidate.edits)
            .await?;

        let mut body = pr_body(candidate, report, run);
        if let Some(tip) = moved_to {
            body.push_str(&format!(
                "\nNote: `{base}` has moved to `{}` since the failed run. This branch is based on \
                 the validated commit `{}`.\n",
                short_sha(tip),
                short_sha(&run.trigger.head_sha)
            ));
        }
        let draft = PullRequestDraft {
            title: pr_title(candidate, run),
            body,
            head_branch: branch.to_string(),
            base_branch: base.to_string(),
            draft: self.config.draft,
        };
        let opened = self.scm.open_pull_request(repo, &draft).await?;
        info!(number = opened.number, url = %opened.url, branch = %branch, "pull request opened");

        Ok(PullRequestRecord {
            branch: branch.to_string(),
            commit_sha,
            number: opened.number,
            url: opened.url,
            run: run.key.clone(),
            candidate_id: candidate.id,
            candidate_digest: candidate.digest.clone(),
            created_at: Utc::now(),
        })
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn pr_title(candidate: &FixCandidate, run: &WorkflowRun) -> String {
    let cause = first_line(&candidate.analysis.root_cause);
    let cause: String = cause.chars().take(72).collect();
    format!("fix(ci): {cause} (run {})", run.key.run_id)
}

fn commit_message(candidate: &FixCandidate, run: &WorkflowRun) -> String {
    format!(
        "{}\n\n{}\n\nRemediates {} at {}.\nCandidate-Digest: {}\n",
        pr_title(candidate, run),
        candidate.rationale,
        run.key,
        short_sha(&run.trigger.head_sha),
        candidate.digest
    )
}

fn pr_body(candidate: &FixCandidate, report: &ValidationReport, run: &WorkflowRun) -> String {
    let analysis = &candidate.analysis;
    let files = candidate
        .edits
        .iter()
        .map(|e| {
            let kind = match e.kind {
                EditKind::Create => "create",
                EditKind::Modify => "modify",
                EditKind::Delete => "delete",
            };
            format!("- `{}` ({kind})", e.path)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Automated fix for failed run {describe}.\n\n\
         ## Root cause\n{cause}\n\n\
         Diagnosed by `{provider}` (confidence {confidence:.2}).\n\n\
         ## Changes\n{rationale}\n\n{files}\n\n\
         ## Validation\n{metrics}\n\n\
         Candidate digest: `{digest}`\n",
        describe = run.describe(),
        cause = analysis.root_cause,
        provider = analysis.provider,
        confidence = analysis.confidence,
        rationale = candidate.rationale,
        metrics = report.metrics_line(),
        digest = candidate.digest,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::AnalysisResult;
    use crate::domain::fix::FileEdit;
    use crate::domain::run::{Conclusion, RepoRef, RunKey, TriggerInfo};
    use crate::domain::validation::Verdict;
    use crate::fakes::{MemorySourceControl, FAKE_HEAD_SHA};

    fn repo() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    fn run() -> WorkflowRun {
        WorkflowRun {
            key: RunKey::new(repo(), 77),
            workflow_name: "ci".into(),
            trigger: TriggerInfo {
                event: "push".into(),
                head_branch: "main".into(),
                head_sha: FAKE_HEAD_SHA.into(),
                actor: None,
            },
            conclusion: Conclusion::Failure,
            jobs: vec![],
            fetched_at: Utc::now(),
        }
    }

    fn candidate() -> FixCandidate {
        FixCandidate::new(
            vec![FileEdit::write("src/lib.rs", EditKind::Modify, "fn f() {}")],
            "- rename f".into(),
            AnalysisResult::new("primary", "function renamed upstream").with_confidence(0.7),
        )
        .unwrap()
    }

    fn report_for(c: &FixCandidate, verdict: Verdict) -> ValidationReport {
        ValidationReport {
            candidate_id: c.id,
            candidate_digest: c.digest.clone(),
            verdict,
            detail: None,
            build_log: String::new(),
            tests_passed: 3,
            tests_failed: 0,
            coverage_percent: Some(50.0),
            duration_ms: 10,
            validated_at: Utc::now(),
        }
    }

    fn scm() -> Arc<MemorySourceControl> {
        Arc::new(MemorySourceControl::new().with_branch(&repo(), "main", FAKE_HEAD_SHA))
    }

    #[tokio::test]
    async fn test_publish_creates_branch_commit_and_pr() {
        let scm = scm();
        let publisher = PullRequestPublisher::new(scm.clone(), PublisherConfig::default());
        let c = candidate();
        let record = publisher
            .publish(&c, &report_for(&c, Verdict::Pass), &run())
            .await
            .unwrap();

        assert_eq!(record.branch, format!("cimend/fix/run-77-{}", c.short_digest()));
        assert_eq!(record.candidate_digest, c.digest);
        let commits = scm.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].parent_sha, FAKE_HEAD_SHA);
        assert_eq!(commits[0].edits, c.edits);

        let prs = scm.pull_requests();
        let body = &prs[0].1.body;
        assert!(body.contains("function renamed upstream"));
        assert!(body.contains("tests passed: 3"));
        assert_eq!(prs[0].1.base_branch, "main");
    }

    #[tokio::test]
    async fn test_refuses_unvalidated_candidates() {
        let scm = scm();
        let publisher = PullRequestPublisher::new(scm.clone(), PublisherConfig::default());
        let c = candidate();

        let failing = report_for(&c, Verdict::Fail);
        assert!(matches!(
            publisher.publish(&c, &failing, &run()).await,
            Err(PublishError::Unvalidated { .. })
        ));

        let other = candidate();
        let mismatched = report_for(&other, Verdict::Pass);
        assert!(matches!(
            publisher.publish(&c, &mismatched, &run()).await,
            Err(PublishError::Unvalidated { .. })
        ));

        let mut tampered = c.clone();
        tampered.edits.push(FileEdit::delete("README.md"));
        assert!(matches!(
            publisher
                .publish(&tampered, &report_for(&c, Verdict::Pass), &run())
                .await,
            Err(PublishError::Unvalidated { .. })
        ));

        assert!(scm.commits().is_empty());
        assert!(scm.pull_requests().is_empty());
    }

    #[tokio::test]
    async fn test_conflict_retried_once_with_fresh_branch() {
        let scm = Arc::new(
            MemorySourceControl::new()
                .with_branch(&repo(), "main", FAKE_HEAD_SHA)
                .fail_create_branch(ScmError::Conflict("exists".into())),
        );
        let publisher = PullRequestPublisher::new(scm.clone(), PublisherConfig::default());
        let c = candidate();
        let record = publisher
            .publish(&c, &report_for(&c, Verdict::Pass), &run())
            .await
            .unwrap();
        let first = format!("cimend/fix/run-77-{}", c.short_digest());
        assert!(record.branch.starts_with(&first));
        assert_ne!(record.branch, first);
    }

    #[tokio::test]
    async fn test_second_conflict_surfaces() {
        let scm = Arc::new(
            MemorySourceControl::new()
                .with_branch(&repo(), "main", FAKE_HEAD_SHA)
                .fail_create_branch(ScmError::Conflict("exists".into()))
                .fail_create_branch(ScmError::Conflict("exists again".into())),
        );
        let publisher = PullRequestPublisher::new(scm, PublisherConfig::default());
        let c = candidate();
        assert!(matches!(
            publisher
                .publish(&c, &report_for(&c, Verdict::Pass), &run())
                .await,
            Err(PublishError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_moved_base_branches_from_validated_commit() {
        let moved = "ffffffffffffffffffffffffffffffffffffffff";
        let scm = Arc::new(MemorySourceControl::new().with_branch(&repo(), "main", moved));
        let publisher = PullRequestPublisher::new(scm.clone(), PublisherConfig::default());
        let c = candidate();
        publisher
            .publish(&c, &report_for(&c, Verdict::Pass), &run())
            .await
            .unwrap();

        let commits = scm.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].parent_sha, FAKE_HEAD_SHA);
        assert_eq!(scm.branch(&repo(), "main").as_deref(), Some(moved));
        let prs = scm.pull_requests();
        assert_eq!(prs[0].1.base_branch, "main");
        assert!(prs[0].1.body.contains("has moved to `ffffffff`"));
    }

    #[tokio::test]
    async fn test_conflict_after_branch_creation_deletes_first_branch() {
        let scm = Arc::new(
            MemorySourceControl::new()
                .with_branch(&repo(), "main", FAKE_HEAD_SHA)
                .fail_open_pull_request(ScmError::Conflict("pull request exists".into())),
        );
        let publisher = PullRequestPublisher::new(scm.clone(), PublisherConfig::default());
        let c = candidate();
        let record = publisher
            .publish(&c, &report_for(&c, Verdict::Pass), &run())
            .await
            .unwrap();

        let first = format!("cimend/fix/run-77-{}", c.short_digest());
        assert_ne!(record.branch, first);
        assert_eq!(scm.deleted_branches(), vec![first.clone()]);
        assert!(scm.branch(&repo(), &first).is_none());
        assert!(scm.branch(&repo(), &record.branch).is_some());
        assert_eq!(scm.pull_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_not_retried() {
        let scm = Arc::new(
            MemorySourceControl::new()
                .with_branch(&repo(), "main", FAKE_HEAD_SHA)
                .fail_create_branch(ScmError::PermissionDenied("read-only token".into())),
        );
        let publisher = PullRequestPublisher::new(scm.clone(), PublisherConfig::default());
        let c = candidate();
        assert!(matches!(
            publisher
                .publish(&c, &report_for(&c, Verdict::Pass), &run())
                .await,
            Err(PublishError::PermissionDenied(_))
        ));
        assert!(scm.branch(&repo(), &format!("cimend/fix/run-77-{}", c.short_digest())).is_none());
        assert!(scm.deleted_branches().is_empty(), "nothing was created");
    }
}
