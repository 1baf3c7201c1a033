//! Source-control collaborator contract.
//!
//! The core treats every call as a capability returning a structured result
//! or a typed [`ScmError`]. Retrying transient failures is the caller's job,
//! not the implementation's.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::fix::FileEdit;
use crate::domain::run::{Conclusion, JobResult, RepoRef, TriggerInfo};

/// Errors returned by a [`SourceControl`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("source control error: {0}")]
    Other(String),
}

impl ScmError {
    /// Rate limits, timeouts and 5xx-class failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScmError::RateLimited { .. } | ScmError::Transient(_))
    }
}

pub type ScmResult<T> = std::result::Result<T, ScmError>;

/// Run metadata without logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub workflow_name: String,
    pub trigger: TriggerInfo,
    pub conclusion: Conclusion,
    /// Jobs with empty `log` fields.
    pub jobs: Vec<JobResult>,
}

/// Pull request to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestDraft {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
    pub draft: bool,
}

/// Identity of an opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedPullRequest {
    pub number: u64,
    pub url: String,
}

/// Read/write access to a hosted repository and its CI runs.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn fetch_run(&self, repo: &RepoRef, run_id: u64) -> ScmResult<RunMetadata>;

    /// Log text of one job of a run.
    async fn fetch_logs(&self, repo: &RepoRef, run_id: u64, job_id: u64) -> ScmResult<String>;

    /// File content at `git_ref`, `None` if the path does not exist.
    async fn read_file(&self, repo: &RepoRef, git_ref: &str, path: &str)
        -> ScmResult<Option<String>>;

    /// Current tip SHA of `branch`.
    async fn branch_tip(&self, repo: &RepoRef, branch: &str) -> ScmResult<String>;

    /// Create `branch` at `from_sha`. Fails with `Conflict` if it exists.
    async fn create_branch(&self, repo: &RepoRef, branch: &str, from_sha: &str) -> ScmResult<()>;

    /// Delete `branch`. Deleting a missing branch succeeds.
    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> ScmResult<()>;

    /// Commit `edits` on top of `parent_sha` and advance `branch`. Returns the new SHA.
    async fn commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        parent_sha: &str,
        message: &str,
        edits: &[FileEdit],
    ) -> ScmResult<String>;

    async fn open_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> ScmResult<OpenedPullRequest>;

    /// Most recent failed run identifiers, newest first.
    async fn list_failed_runs(&self, repo: &RepoRef, limit: usize) -> ScmResult<Vec<u64>>;
}

/// Read-only view of the source tree a fix is generated against.
#[async_trait]
pub trait SourceView: Send + Sync {
    async fn read_file(&self, path: &str) -> ScmResult<Option<String>>;
}

/// [`SourceView`] over a [`SourceControl`] at a fixed commit.
pub struct ScmSourceView {
    scm: Arc<dyn SourceControl>,
    repo: RepoRef,
    git_ref: String,
}

impl ScmSourceView {
    pub fn new(scm: Arc<dyn SourceControl>, repo: RepoRef, git_ref: impl Into<String>) -> Self {
        Self {
            scm,
            repo,
            git_ref: git_ref.into(),
        }
    }
}

#[async_trait]
impl SourceView for ScmSourceView {
    async fn read_file(&self, path: &str) -> ScmResult<Option<String>> {
        self.scm.read_file(&self.repo, &self.git_ref, path).await
    }
}
