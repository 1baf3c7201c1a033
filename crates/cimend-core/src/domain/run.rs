//! Workflow run model: the failing CI execution a remediation attempt targets.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::CimendError;

/// Repository coordinates (`owner/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = CimendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(CimendError::InvalidRepository(format!(
                "expected owner/name, got '{s}'"
            ))),
        }
    }
}

/// Identity of one remediation target: repository plus run identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub repo: RepoRef,
    pub run_id: u64,
}

impl RunKey {
    pub fn new(repo: RepoRef, run_id: u64) -> Self {
        Self { repo, run_id }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.run_id)
    }
}

/// Final conclusion of a run, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Skipped,
    Neutral,
}

impl Conclusion {
    /// Whether this conclusion counts as a failure worth remediating.
    pub fn is_failure(&self) -> bool {
        matches!(self, Conclusion::Failure | Conclusion::TimedOut)
    }
}

/// What triggered the run and which commit it ran against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Event name (`push`, `pull_request`, `workflow_dispatch`, ...).
    pub event: String,
    pub head_branch: String,
    pub head_sha: String,
    pub actor: Option<String>,
}

/// Result of one step inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub number: u32,
    pub name: String,
    pub conclusion: Conclusion,
}

/// Result of one job, including its captured log text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: u64,
    pub name: String,
    pub conclusion: Conclusion,
    pub steps: Vec<StepResult>,
    /// Raw log text. Only populated for failed jobs.
    #[serde(default)]
    pub log: String,
    pub exit_code: Option<i32>,
}

impl JobResult {
    /// First step that failed, if any.
    pub fn failing_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.conclusion.is_failure())
    }
}

/// A fetched workflow run. Immutable once built by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub key: RunKey,
    pub workflow_name: String,
    pub trigger: TriggerInfo,
    pub conclusion: Conclusion,
    pub jobs: Vec<JobResult>,
    pub fetched_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Jobs whose conclusion is a failure, in the order the run lists them.
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs.iter().filter(|j| j.conclusion.is_failure())
    }

    /// Short one-line description used in prompts and summaries.
    pub fn describe(&self) -> String {
        let failed: Vec<&str> = self.failed_jobs().map(|j| j.name.as_str()).collect();
        format!(
            "{} run {} on {} ({}) failed jobs: [{}]",
            self.workflow_name,
            self.key,
            self.trigger.head_branch,
            short_sha(&self.trigger.head_sha),
            failed.join(", ")
        )
    }
}

/// First 8 characters of a commit SHA.
pub fn short_sha(sha: &str) -> &str {
    &sha[..8.min(sha.len())]
}
