//! [`SandboxRuntime`] backed by throwaway copies of local checkouts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use cimend_core::domain::fix::FileEdit;
use cimend_core::sandbox::{
    CommandOutput, CommandSpec, RepoSnapshot, SandboxError, SandboxResult, SandboxRuntime,
    WorkspaceHandle,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::runner::CommandRunner;
use crate::workspace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSandboxConfig {
    /// `owner/name` to the local checkout used as the workspace source.
    pub checkouts: BTreeMap<String, PathBuf>,
    /// Parent directory for workspaces. System temp dir when unset.
    pub work_root: Option<PathBuf>,
    /// Directory names never copied into a workspace.
    pub skip_dirs: Vec<String>,
    /// Per-command output kept, in bytes, from the end.
    pub max_output_bytes: usize,
    /// Refuse a git checkout whose `HEAD` is not the snapshot commit.
    pub verify_head: bool,
}

impl Default for LocalSandboxConfig {
    fn default() -> Self {
        Self {
            checkouts: BTreeMap::new(),
            work_root: None,
            skip_dirs: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
            ],
            max_output_bytes: 256 * 1024,
            verify_head: true,
        }
    }
}

/// Copies a local checkout into a fresh temporary directory per workspace
/// and runs commands there with `sh -c`.
pub struct LocalSandbox {
    config: LocalSandboxConfig,
    workspaces: Mutex<HashMap<Uuid, TempDir>>,
}

impl LocalSandbox {
    pub fn new(config: LocalSandboxConfig) -> SandboxResult<Self> {
        if config.max_output_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_output_bytes must be greater than zero".into(),
            ));
        }
        for (repo, path) in &config.checkouts {
            if !path.is_dir() {
                return Err(SandboxError::InvalidConfig(format!(
                    "checkout for {repo} is not a directory: {}",
                    path.display()
                )));
            }
        }
        Ok(Self {
            config,
            workspaces: Mutex::new(HashMap::new()),
        })
    }

    /// Workspaces currently held.
    pub fn active(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TempDir>> {
        self.workspaces.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn root_of<'a>(&self, handle: &'a WorkspaceHandle) -> SandboxResult<&'a Path> {
        if !self.lock().contains_key(&handle.id) {
            return Err(SandboxError::Exec {
                command: String::new(),
                reason: format!("unknown workspace {}", handle.id),
            });
        }
        handle
            .root
            .as_deref()
            .ok_or_else(|| SandboxError::Apply(format!("workspace {} has no root", handle.id)))
    }
}

async fn checkout_head(checkout: &Path) -> Option<String> {
    let out = Command::new("git")
        .arg("-C")
        .arg(checkout)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
}

#[async_trait]
impl SandboxRuntime for LocalSandbox {
    async fn acquire_workspace(&self, snapshot: &RepoSnapshot) -> SandboxResult<WorkspaceHandle> {
        let repo = snapshot.repo.to_string();
        let checkout = self
            .config
            .checkouts
            .get(&repo)
            .cloned()
            .ok_or_else(|| SandboxError::Acquire(format!("no local checkout configured for {repo}")))?;

        if self.config.verify_head {
            match checkout_head(&checkout).await {
                Some(head) if head != snapshot.commit_sha => {
                    warn!(
                        repo = %repo,
                        head = %head,
                        expected = %snapshot.commit_sha,
                        "local checkout is not at the failed commit"
                    );
                    return Err(SandboxError::Acquire(format!(
                        "checkout for {repo} is at {head}, expected {}",
                        snapshot.commit_sha
                    )));
                }
                Some(_) => {}
                None => debug!(repo = %repo, "checkout is not a git work tree"),
            }
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("cimend-ws-");
        let dir = match &self.config.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::Acquire(e.to_string()))?;

        let dst = dir.path().to_path_buf();
        let skip = self.config.skip_dirs.clone();
        let copied = tokio::task::spawn_blocking(move || workspace::copy_tree(&checkout, &dst, &skip))
            .await
            .map_err(|e| SandboxError::Acquire(e.to_string()))?
            .map_err(|e| SandboxError::Acquire(format!("copying checkout: {e}")))?;

        let handle = WorkspaceHandle::new(Some(dir.path().to_path_buf()));
        info!(workspace = %handle.id, repo = %repo, files = copied, "workspace acquired");
        self.lock().insert(handle.id, dir);
        Ok(handle)
    }

    async fn apply_edits(&self, handle: &WorkspaceHandle, edits: &[FileEdit]) -> SandboxResult<()> {
        let root = self.root_of(handle)?.to_path_buf();
        let edits = edits.to_vec();
        tokio::task::spawn_blocking(move || workspace::apply_edits(&root, &edits))
            .await
            .map_err(|e| SandboxError::Apply(e.to_string()))?
    }

    async fn run_command(
        &self,
        handle: &WorkspaceHandle,
        command: &CommandSpec,
    ) -> SandboxResult<CommandOutput> {
        let root = self.root_of(handle)?;
        CommandRunner::execute(command, root, self.config.max_output_bytes).await
    }

    async fn release(&self, handle: WorkspaceHandle) -> SandboxResult<()> {
        let dir = self.lock().remove(&handle.id);
        match dir {
            Some(dir) => {
                tokio::task::spawn_blocking(move || dir.close())
                    .await
                    .map_err(|e| SandboxError::Release(e.to_string()))?
                    .map_err(|e| SandboxError::Release(e.to_string()))?;
                debug!(workspace = %handle.id, "workspace released");
                Ok(())
            }
            None => Err(SandboxError::Release(format!(
                "unknown workspace {}",
                handle.id
            ))),
        }
    }
}
