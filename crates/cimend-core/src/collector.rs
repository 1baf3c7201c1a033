//! Failure collector: turns a run identifier into a normalized [`WorkflowRun`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::domain::run::{RepoRef, RunKey, WorkflowRun};
use crate::retry::{retry_transient, BackoffPolicy};
use crate::scm::{ScmError, SourceControl};

/// Errors surfaced by [`FailureCollector::collect`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectError {
    /// Definitive 404/permission failure. Never retried.
    #[error("run not found or not readable: {0}")]
    NotFound(String),

    /// Transient failures persisted past the retry budget.
    #[error("transient fetch error after {attempts} attempt(s): {detail}")]
    TransientFetchError { attempts: u32, detail: String },
}

impl CollectError {
    fn from_scm(err: ScmError, attempts: u32) -> Self {
        match err {
            ScmError::NotFound(d) | ScmError::PermissionDenied(d) => CollectError::NotFound(d),
            other => CollectError::TransientFetchError {
                attempts,
                detail: other.to_string(),
            },
        }
    }
}

/// Fetches run metadata and the logs of every failed job.
pub struct FailureCollector {
    scm: Arc<dyn SourceControl>,
    backoff: BackoffPolicy,
}

impl FailureCollector {
    pub fn new(scm: Arc<dyn SourceControl>, backoff: BackoffPolicy) -> Self {
        Self { scm, backoff }
    }

    #[instrument(skip(self), fields(repo = %repo, run_id))]
    pub async fn collect(&self, repo: &RepoRef, run_id: u64) -> Result<WorkflowRun, CollectError> {
        let scm = &self.scm;

        let mut tries = 0;
        let meta = retry_transient(&self.backoff, "fetch_run", ScmError::is_transient, |n| {
            tries = n;
            scm.fetch_run(repo, run_id)
        })
        .await
        .map_err(|e| CollectError::from_scm(e, tries))?;

        let mut jobs = meta.jobs;
        for job in jobs.iter_mut().filter(|j| j.conclusion.is_failure()) {
            let job_id = job.id;
            let mut tries = 0;
            let log = retry_transient(&self.backoff, "fetch_logs", ScmError::is_transient, |n| {
                tries = n;
                scm.fetch_logs(repo, run_id, job_id)
            })
            .await
            .map_err(|e| CollectError::from_scm(e, tries))?;
            debug!(job = %job.name, bytes = log.len(), "fetched job log");
            job.log = log;
        }

        Ok(WorkflowRun {
            key: RunKey::new(repo.clone(), run_id),
            workflow_name: meta.workflow_name,
            trigger: meta.trigger,
            conclusion: meta.conclusion,
            jobs,
            fetched_at: Utc::now(),
        })
    }
}
