//! In-memory collaborator fakes (testing only).
//!
//! `MemorySourceControl`, `ScriptedProvider`, `ScriptedSandbox` and
//! `MapSourceView` satisfy the collaborator contracts without network,
//! processes or disk, and record what they were asked to do.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::digest::sha256_hex;
use crate::domain::fix::{EditKind, FileEdit};
use crate::domain::run::{Conclusion, JobResult, RepoRef, StepResult, TriggerInfo};
use crate::provider::{ProposalRequest, Provider, ProviderError, ProviderReply, ProviderResult};
use crate::sandbox::{
    CommandOutput, CommandSpec, RepoSnapshot, SandboxError, SandboxResult, SandboxRuntime,
    WorkspaceHandle,
};
use crate::scm::{
    OpenedPullRequest, PullRequestDraft, RunMetadata, ScmError, ScmResult, SourceControl,
    SourceView,
};

/// Head commit used by [`MemorySourceControl::with_failed_run`].
pub const FAKE_HEAD_SHA: &str = "0a1b2c3d4e5f60718293a4b5c6d7e8f901234567";

// ---------------------------------------------------------------------------
// MemorySourceControl
// ---------------------------------------------------------------------------

/// A commit recorded by [`MemorySourceControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub repo: RepoRef,
    pub branch: String,
    pub parent_sha: String,
    pub sha: String,
    pub message: String,
    pub edits: Vec<FileEdit>,
}

#[derive(Debug, Default)]
struct ScmState {
    runs: HashMap<(RepoRef, u64), RunMetadata>,
    logs: HashMap<(RepoRef, u64), String>,
    files: HashMap<RepoRef, BTreeMap<String, String>>,
    branches: HashMap<(RepoRef, String), String>,
    commits: Vec<RecordedCommit>,
    deleted_branches: Vec<String>,
    pull_requests: Vec<(RepoRef, PullRequestDraft, OpenedPullRequest)>,
    fetch_run_failures: VecDeque<ScmError>,
    create_branch_failures: VecDeque<ScmError>,
    open_pr_failures: VecDeque<ScmError>,
}

/// In-memory source control host.
///
/// Queued failures are returned, one per call, before normal behavior.
#[derive(Debug, Default)]
pub struct MemorySourceControl {
    state: Mutex<ScmState>,
    fetch_run_calls: AtomicU32,
    read_calls: AtomicU32,
}

impl MemorySourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(
        self,
        repo: &RepoRef,
        run_id: u64,
        metadata: RunMetadata,
        logs: Vec<(u64, String)>,
    ) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.runs.insert((repo.clone(), run_id), metadata);
            for (job_id, log) in logs {
                state.logs.insert((repo.clone(), job_id), log);
            }
        }
        self
    }

    /// Add a failed push run on `main` with one failing `build` job.
    ///
    /// The job id is `run_id * 10 + 1`; `main` points at [`FAKE_HEAD_SHA`].
    pub fn with_failed_run(self, repo: &RepoRef, run_id: u64, log: &str) -> Self {
        let job_id = run_id * 10 + 1;
        let metadata = RunMetadata {
            workflow_name: "ci".to_string(),
            trigger: TriggerInfo {
                event: "push".to_string(),
                head_branch: "main".to_string(),
                head_sha: FAKE_HEAD_SHA.to_string(),
                actor: Some("octocat".to_string()),
            },
            conclusion: Conclusion::Failure,
            jobs: vec![JobResult {
                id: job_id,
                name: "build".to_string(),
                conclusion: Conclusion::Failure,
                steps: vec![
                    StepResult {
                        number: 1,
                        name: "checkout".to_string(),
                        conclusion: Conclusion::Success,
                    },
                    StepResult {
                        number: 2,
                        name: "cargo build".to_string(),
                        conclusion: Conclusion::Failure,
                    },
                ],
                log: String::new(),
                exit_code: None,
            }],
        };
        self.with_run(repo, run_id, metadata, vec![(job_id, log.to_string())])
            .with_branch(repo, "main", FAKE_HEAD_SHA)
    }

    pub fn with_file(self, repo: &RepoRef, path: &str, content: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .entry(repo.clone())
            .or_default()
            .insert(path.to_string(), content.to_string());
        self
    }

    pub fn with_branch(self, repo: &RepoRef, branch: &str, sha: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .branches
            .insert((repo.clone(), branch.to_string()), sha.to_string());
        self
    }

    pub fn fail_fetch_run(self, err: ScmError) -> Self {
        self.state.lock().unwrap().fetch_run_failures.push_back(err);
        self
    }

    pub fn fail_create_branch(self, err: ScmError) -> Self {
        self.state
            .lock()
            .unwrap()
            .create_branch_failures
            .push_back(err);
        self
    }

    pub fn fail_open_pull_request(self, err: ScmError) -> Self {
        self.state.lock().unwrap().open_pr_failures.push_back(err);
        self
    }

    pub fn fetch_run_calls(&self) -> u32 {
        self.fetch_run_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u32 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pull_requests(&self) -> Vec<(RepoRef, PullRequestDraft, OpenedPullRequest)> {
        self.state.lock().unwrap().pull_requests.clone()
    }

    /// Branch names passed to `delete_branch`, in call order.
    pub fn deleted_branches(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_branches.clone()
    }

    pub fn branch(&self, repo: &RepoRef, branch: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(&(repo.clone(), branch.to_string()))
            .cloned()
    }
}

#[async_trait]
impl SourceControl for MemorySourceControl {
    async fn fetch_run(&self, repo: &RepoRef, run_id: u64) -> ScmResult<RunMetadata> {
        self.fetch_run_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fetch_run_failures.pop_front() {
            return Err(err);
        }
        state
            .runs
            .get(&(repo.clone(), run_id))
            .cloned()
            .ok_or_else(|| ScmError::NotFound(format!("run {run_id} in {repo}")))
    }

    async fn fetch_logs(&self, repo: &RepoRef, _run_id: u64, job_id: u64) -> ScmResult<String> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .get(&(repo.clone(), job_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn read_file(
        &self,
        repo: &RepoRef,
        _git_ref: &str,
        path: &str,
    ) -> ScmResult<Option<String>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state.files.get(repo).and_then(|t| t.get(path)).cloned())
    }

    async fn branch_tip(&self, repo: &RepoRef, branch: &str) -> ScmResult<String> {
        self.branch(repo, branch)
            .ok_or_else(|| ScmError::NotFound(format!("branch {branch} in {repo}")))
    }

    async fn create_branch(&self, repo: &RepoRef, branch: &str, from_sha: &str) -> ScmResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.create_branch_failures.pop_front() {
            return Err(err);
        }
        let key = (repo.clone(), branch.to_string());
        if state.branches.contains_key(&key) {
            return Err(ScmError::Conflict(format!("branch {branch} already exists")));
        }
        state.branches.insert(key, from_sha.to_string());
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> ScmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.branches.remove(&(repo.clone(), branch.to_string()));
        state.deleted_branches.push(branch.to_string());
        Ok(())
    }

    async fn commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        parent_sha: &str,
        message: &str,
        edits: &[FileEdit],
    ) -> ScmResult<String> {
        let mut state = self.state.lock().unwrap();
        let key = (repo.clone(), branch.to_string());
        match state.branches.get(&key) {
            None => return Err(ScmError::NotFound(format!("branch {branch}"))),
            Some(tip) if tip != parent_sha => {
                return Err(ScmError::Conflict(format!("{branch} moved to {tip}")));
            }
            Some(_) => {}
        }
        let sha = sha256_hex(format!("{parent_sha}\n{message}\n{}", edits.len()).as_bytes())
            [..40]
            .to_string();
        state.branches.insert(key, sha.clone());
        state.commits.push(RecordedCommit {
            repo: repo.clone(),
            branch: branch.to_string(),
            parent_sha: parent_sha.to_string(),
            sha: sha.clone(),
            message: message.to_string(),
            edits: edits.to_vec(),
        });
        Ok(sha)
    }

    async fn open_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> ScmResult<OpenedPullRequest> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.open_pr_failures.pop_front() {
            return Err(err);
        }
        let number = state.pull_requests.len() as u64 + 1;
        let opened = OpenedPullRequest {
            number,
            url: format!("https://scm.example/{repo}/pull/{number}"),
        };
        state
            .pull_requests
            .push((repo.clone(), draft.clone(), opened.clone()));
        Ok(opened)
    }

    async fn list_failed_runs(&self, repo: &RepoRef, limit: usize) -> ScmResult<Vec<u64>> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<u64> = state
            .runs
            .iter()
            .filter(|((r, _), meta)| r == repo && meta.conclusion.is_failure())
            .map(|((_, id), _)| *id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.truncate(limit);
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// MapSourceView
// ---------------------------------------------------------------------------

/// Source tree backed by a map of path to content.
#[derive(Debug, Clone, Default)]
pub struct MapSourceView {
    files: BTreeMap<String, String>,
}

impl MapSourceView {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            files: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl SourceView for MapSourceView {
    async fn read_file(&self, path: &str) -> ScmResult<Option<String>> {
        Ok(self.files.get(path).cloned())
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// Shared, ordered log of provider invocations across several fakes.
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<String>>>);

impl CallJournal {
    fn record(&self, provider: &str) {
        self.0.lock().unwrap().push(provider.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ProviderStep {
    Reply(ProviderReply),
    Error(ProviderError),
    /// Never answers; the orchestrator's timeout fires.
    Hang,
    /// Answer after a delay.
    Delayed(Duration, Box<ProviderStep>),
}

/// Provider that plays back a fixed script, one step per call.
///
/// Once the script is spent every call fails with a transport error.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    steps: Mutex<VecDeque<ProviderStep>>,
    requests: Mutex<Vec<ProposalRequest>>,
    journal: Option<CallJournal>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn then(self, step: ProviderStep) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub fn reply(self, reply: ProviderReply) -> Self {
        self.then(ProviderStep::Reply(reply))
    }

    pub fn error(self, err: ProviderError) -> Self {
        self.then(ProviderStep::Error(err))
    }

    pub fn hang(self) -> Self {
        self.then(ProviderStep::Hang)
    }

    pub fn reply_after(self, delay: Duration, reply: ProviderReply) -> Self {
        self.then(ProviderStep::Delayed(
            delay,
            Box::new(ProviderStep::Reply(reply)),
        ))
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProposalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn propose(&self, request: &ProposalRequest) -> ProviderResult<ProviderReply> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(journal) = &self.journal {
            journal.record(&self.name);
        }
        let step = self.steps.lock().unwrap().pop_front();
        let mut step = match step {
            Some(step) => step,
            None => return Err(ProviderError::Transport("script exhausted".into())),
        };
        loop {
            match step {
                ProviderStep::Reply(reply) => return Ok(reply),
                ProviderStep::Error(err) => return Err(err),
                ProviderStep::Hang => return std::future::pending().await,
                ProviderStep::Delayed(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedSandbox
// ---------------------------------------------------------------------------

/// One scripted command result.
#[derive(Debug, Clone)]
pub enum SandboxStep {
    Output(CommandOutput),
    Error(SandboxError),
    /// Never finishes; the validation deadline fires.
    Hang,
    Delayed(Duration, Box<SandboxStep>),
}

impl SandboxStep {
    pub fn exit(code: i32, output: &str) -> Self {
        SandboxStep::Output(CommandOutput {
            exit_code: Some(code),
            output: output.to_string(),
            duration_ms: 1,
        })
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    steps: VecDeque<SandboxStep>,
    acquire_failures: VecDeque<SandboxError>,
    commands: Vec<String>,
    applied: Vec<FileEdit>,
    snapshots: Vec<RepoSnapshot>,
}

/// Sandbox runtime that plays back command results, one step per command.
///
/// Once the script is spent every command exits 0 with empty output.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    state: Mutex<SandboxState>,
    released: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, step: SandboxStep) -> Self {
        self.state.lock().unwrap().steps.push_back(step);
        self
    }

    pub fn fail_acquire(self, reason: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .acquire_failures
            .push_back(SandboxError::Acquire(reason.to_string()));
        self
    }

    /// Script one validation whose build passes and whose tests fail.
    pub fn failing_validation(self) -> Self {
        self.then(SandboxStep::exit(0, "Finished dev profile"))
            .then(SandboxStep::exit(
                101,
                "test result: FAILED. 4 passed; 1 failed; 0 ignored",
            ))
    }

    /// Script one validation whose build and tests pass.
    pub fn passing_validation(self) -> Self {
        self.then(SandboxStep::exit(0, "Finished dev profile"))
            .then(SandboxStep::exit(
                0,
                "test result: ok. 5 passed; 0 failed; 0 ignored",
            ))
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Largest number of simultaneously held workspaces.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn applied_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .map(|e| e.path.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<RepoSnapshot> {
        self.state.lock().unwrap().snapshots.clone()
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedSandbox {
    async fn acquire_workspace(&self, snapshot: &RepoSnapshot) -> SandboxResult<WorkspaceHandle> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.acquire_failures.pop_front() {
                return Err(err);
            }
            state.snapshots.push(snapshot.clone());
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        Ok(WorkspaceHandle::new(None))
    }

    async fn apply_edits(&self, _handle: &WorkspaceHandle, edits: &[FileEdit]) -> SandboxResult<()> {
        let mut state = self.state.lock().unwrap();
        for edit in edits {
            if edit.kind != EditKind::Delete && edit.content.is_none() {
                return Err(SandboxError::Apply(format!("{} has no content", edit.path)));
            }
        }
        state.applied.extend_from_slice(edits);
        Ok(())
    }

    async fn run_command(
        &self,
        _handle: &WorkspaceHandle,
        command: &CommandSpec,
    ) -> SandboxResult<CommandOutput> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command.command.clone());
            state.steps.pop_front()
        };
        let mut step = match step {
            Some(step) => step,
            None => return Ok(SandboxStep::exit(0, "").into_output()),
        };
        loop {
            match step {
                SandboxStep::Output(out) => return Ok(out),
                SandboxStep::Error(err) => return Err(err),
                SandboxStep::Hang => return std::future::pending().await,
                SandboxStep::Delayed(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }

    async fn release(&self, _handle: WorkspaceHandle) -> SandboxResult<()> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SandboxStep {
    fn into_output(self) -> CommandOutput {
        match self {
            SandboxStep::Output(out) => out,
            _ => CommandOutput {
                exit_code: Some(0),
                output: String::new(),
                duration_ms: 0,
            },
        }
    }
}
