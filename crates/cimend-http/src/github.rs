//! GitHub REST source-control client.
//!
//! Commits are built with the git-data API (blobs, tree, commit, ref update)
//! so no local clone is needed.

use std::time::Duration;

use async_trait::async_trait;
use cimend_core::domain::fix::{EditKind, FileEdit};
use cimend_core::domain::run::{Conclusion, JobResult, RepoRef, StepResult, TriggerInfo};
use cimend_core::scm::{
    OpenedPullRequest, PullRequestDraft, RunMetadata, ScmError, ScmResult, SourceControl,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::status::{scm_error, scm_transport_error};

const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base: String,
    /// Environment variable holding the access token.
    pub token_env: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            timeout_secs: 30,
            user_agent: format!("cimend/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, token: Option<String>) -> ScmResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ScmError::Other(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Build a client reading the token from `config.token_env`.
    pub fn from_env(config: &GitHubConfig) -> ScmResult<Self> {
        Self::new(config, std::env::var(&config.token_env).ok())
    }

    fn url(&self, repo: &RepoRef, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_base, repo.owner, repo.name, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.request_as(method, url, JSON_MEDIA_TYPE)
    }

    fn request_as(&self, method: Method, url: &str, accept: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, accept)
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> ScmResult<Response> {
        let response = builder.send().await.map_err(scm_transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(scm_error(status, &headers, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> ScmResult<T> {
        let response = self.send(self.request(Method::GET, url)).await?;
        response.json().await.map_err(scm_transport_error)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
    ) -> ScmResult<T> {
        let response = self.send(self.request(method, url).json(body)).await?;
        response.json().await.map_err(scm_transport_error)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct WireActor {
    login: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRun {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    head_branch: Option<String>,
    head_sha: String,
    event: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    actor: Option<WireActor>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireStep {
    number: u32,
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireJob {
    id: u64,
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<WireStep>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireJobs {
    jobs: Vec<WireJob>,
}

#[derive(Debug, Deserialize)]
struct WireRunId {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct WireRuns {
    workflow_runs: Vec<WireRunId>,
}

#[derive(Debug, Deserialize)]
struct WireObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct WireRef {
    object: WireObject,
}

#[derive(Debug, Deserialize)]
struct WireCommit {
    sha: String,
    tree: WireObject,
}

#[derive(Debug, Deserialize)]
struct WireSha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct WirePull {
    number: u64,
    html_url: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct TreeEntry {
    path: String,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    /// `None` deletes the path from the base tree.
    sha: Option<String>,
}

/// Map a GitHub conclusion string. In-progress runs have none.
pub(crate) fn conclusion(raw: Option<&str>) -> Conclusion {
    match raw {
        Some("success") => Conclusion::Success,
        Some("failure") | Some("startup_failure") => Conclusion::Failure,
        Some("cancelled") => Conclusion::Cancelled,
        Some("timed_out") => Conclusion::TimedOut,
        Some("skipped") => Conclusion::Skipped,
        _ => Conclusion::Neutral,
    }
}

pub(crate) fn run_metadata(run: WireRun, jobs: WireJobs) -> RunMetadata {
    RunMetadata {
        workflow_name: run.name.unwrap_or_else(|| "workflow".to_string()),
        trigger: TriggerInfo {
            event: run.event,
            head_branch: run.head_branch.unwrap_or_default(),
            head_sha: run.head_sha,
            actor: run.actor.map(|a| a.login),
        },
        conclusion: conclusion(run.conclusion.as_deref()),
        jobs: jobs
            .jobs
            .into_iter()
            .map(|job| JobResult {
                id: job.id,
                name: job.name,
                conclusion: conclusion(job.conclusion.as_deref()),
                steps: job
                    .steps
                    .into_iter()
                    .map(|s| StepResult {
                        number: s.number,
                        name: s.name,
                        conclusion: conclusion(s.conclusion.as_deref()),
                    })
                    .collect(),
                log: String::new(),
                exit_code: None,
            })
            .collect(),
    }
}

/// Percent-encode each segment of a repository path for a URL.
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            segment
                .bytes()
                .map(|b| match b {
                    b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                        (b as char).to_string()
                    }
                    _ => format!("%{b:02X}"),
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// SourceControl
// ---------------------------------------------------------------------------

#[async_trait]
impl SourceControl for GitHubClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn fetch_run(&self, repo: &RepoRef, run_id: u64) -> ScmResult<RunMetadata> {
        let run: WireRun = self
            .get_json(&self.url(repo, &format!("/actions/runs/{run_id}")))
            .await?;
        let jobs: WireJobs = self
            .get_json(&self.url(
                repo,
                &format!("/actions/runs/{run_id}/jobs?per_page=100"),
            ))
            .await?;
        debug!(jobs = jobs.jobs.len(), "fetched run");
        Ok(run_metadata(run, jobs))
    }

    async fn fetch_logs(&self, repo: &RepoRef, _run_id: u64, job_id: u64) -> ScmResult<String> {
        let url = self.url(repo, &format!("/actions/jobs/{job_id}/logs"));
        let response = self.send(self.request(Method::GET, &url)).await?;
        response.text().await.map_err(scm_transport_error)
    }

    async fn read_file(
        &self,
        repo: &RepoRef,
        git_ref: &str,
        path: &str,
    ) -> ScmResult<Option<String>> {
        let url = self.url(repo, &format!("/contents/{}", encode_path(path)));
        let builder = self
            .request_as(Method::GET, &url, RAW_MEDIA_TYPE)
            .query(&[("ref", git_ref)]);
        match self.send(builder).await {
            Ok(response) => response
                .text()
                .await
                .map(Some)
                .map_err(scm_transport_error),
            Err(ScmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn branch_tip(&self, repo: &RepoRef, branch: &str) -> ScmResult<String> {
        let wire: WireRef = self
            .get_json(&self.url(repo, &format!("/git/ref/heads/{}", encode_path(branch))))
            .await?;
        Ok(wire.object.sha)
    }

    async fn create_branch(&self, repo: &RepoRef, branch: &str, from_sha: &str) -> ScmResult<()> {
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": from_sha });
        let _: WireRef = self
            .send_json(Method::POST, &self.url(repo, "/git/refs"), &body)
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> ScmResult<()> {
        let url = self.url(repo, &format!("/git/refs/heads/{}", encode_path(branch)));
        match self.send(self.request(Method::DELETE, &url)).await {
            Ok(_) | Err(ScmError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, message, edits), fields(repo = %repo, edits = edits.len()))]
    async fn commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        parent_sha: &str,
        message: &str,
        edits: &[FileEdit],
    ) -> ScmResult<String> {
        let parent: WireCommit = self
            .get_json(&self.url(repo, &format!("/git/commits/{parent_sha}")))
            .await?;

        let mut tree = Vec::with_capacity(edits.len());
        for edit in edits {
            let sha = match (edit.kind, edit.content.as_deref()) {
                (EditKind::Delete, _) => None,
                (_, Some(content)) => {
                    let blob: WireSha = self
                        .send_json(
                            Method::POST,
                            &self.url(repo, "/git/blobs"),
                            &json!({ "content": content, "encoding": "utf-8" }),
                        )
                        .await?;
                    Some(blob.sha)
                }
                (_, None) => {
                    return Err(ScmError::Other(format!("{} has no content", edit.path)));
                }
            };
            tree.push(TreeEntry {
                path: edit.path.clone(),
                mode: "100644",
                kind: "blob",
                sha,
            });
        }

        let new_tree: WireSha = self
            .send_json(
                Method::POST,
                &self.url(repo, "/git/trees"),
                &json!({ "base_tree": parent.tree.sha, "tree": tree }),
            )
            .await?;
        let commit: WireSha = self
            .send_json(
                Method::POST,
                &self.url(repo, "/git/commits"),
                &json!({ "message": message, "tree": new_tree.sha, "parents": [parent.sha] }),
            )
            .await?;
        // Non-fast-forward updates come back as 422 and map to Conflict.
        let _: WireRef = self
            .send_json(
                Method::PATCH,
                &self.url(repo, &format!("/git/refs/heads/{}", encode_path(branch))),
                &json!({ "sha": commit.sha, "force": false }),
            )
            .await?;
        Ok(commit.sha)
    }

    async fn open_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> ScmResult<OpenedPullRequest> {
        let body = json!({
            "title": draft.title,
            "body": draft.body,
            "head": draft.head_branch,
            "base": draft.base_branch,
            "draft": draft.draft,
        });
        let pull: WirePull = self
            .send_json(Method::POST, &self.url(repo, "/pulls"), &body)
            .await?;
        Ok(OpenedPullRequest {
            number: pull.number,
            url: pull.html_url,
        })
    }

    async fn list_failed_runs(&self, repo: &RepoRef, limit: usize) -> ScmResult<Vec<u64>> {
        let per_page = limit.clamp(1, 100);
        let runs: WireRuns = self
            .get_json(&self.url(
                repo,
                &format!("/actions/runs?status=failure&per_page={per_page}"),
            ))
            .await?;
        let mut ids: Vec<u64> = runs.workflow_runs.into_iter().map(|r| r.id).collect();
        ids.truncate(limit);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"{
        "id": 42, "name": "CI", "head_branch": "main",
        "head_sha": "abc123", "event": "push", "conclusion": "failure",
        "actor": {"login": "octocat"}
    }"#;

    const JOBS: &str = r#"{"total_count": 2, "jobs": [
        {"id": 7, "name": "lint", "conclusion": "success", "steps": []},
        {"id": 8, "name": "test", "conclusion": "failure", "steps": [
            {"number": 1, "name": "checkout", "conclusion": "success"},
            {"number": 2, "name": "cargo test", "conclusion": "failure"}
        ]}
    ]}"#;

    #[test]
    fn test_run_metadata_from_wire() {
        let run: WireRun = serde_json::from_str(RUN).unwrap();
        let jobs: WireJobs = serde_json::from_str(JOBS).unwrap();
        let meta = run_metadata(run, jobs);

        assert_eq!(meta.workflow_name, "CI");
        assert_eq!(meta.trigger.head_sha, "abc123");
        assert_eq!(meta.trigger.actor.as_deref(), Some("octocat"));
        assert_eq!(meta.conclusion, Conclusion::Failure);
        assert_eq!(meta.jobs.len(), 2);
        assert_eq!(meta.jobs[1].failing_step().map(|s| s.number), Some(2));
        assert!(meta.jobs.iter().all(|j| j.log.is_empty()));
    }

    #[test]
    fn test_conclusion_mapping() {
        assert_eq!(conclusion(Some("timed_out")), Conclusion::TimedOut);
        assert_eq!(conclusion(Some("startup_failure")), Conclusion::Failure);
        assert_eq!(conclusion(None), Conclusion::Neutral);
        assert_eq!(conclusion(Some("action_required")), Conclusion::Neutral);
    }

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("src/lib.rs"), "src/lib.rs");
        assert_eq!(encode_path("docs/My File.md"), "docs/My%20File.md");
        assert_eq!(encode_path("cimend/fix/run-1"), "cimend/fix/run-1");
    }

    #[test]
    fn test_delete_entry_serializes_null_sha() {
        let entry = TreeEntry {
            path: "old.rs".into(),
            mode: "100644",
            kind: "blob",
            sha: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "blob");
        assert!(value["sha"].is_null());
    }

    #[test]
    fn test_token_from_config_env_name() {
        let config = GitHubConfig {
            token_env: "CIMEND_TEST_TOKEN_UNSET_9f2c".into(),
            ..Default::default()
        };
        let client = GitHubClient::from_env(&config).unwrap();
        assert!(client.token.is_none());
        assert_eq!(
            client.url(&RepoRef::new("acme", "widgets"), "/pulls"),
            "https://api.github.com/repos/acme/widgets/pulls"
        );
    }
}
