//! Sandbox/container collaborator contract and scoped workspace leases.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::fix::FileEdit;
use crate::domain::run::RepoRef;

use super::error::SandboxResult;

/// Repository state a workspace is prepared from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub repo: RepoRef,
    /// Branch the failed run built.
    pub branch: String,
    /// Commit the failed run built.
    pub commit_sha: String,
}

/// Opaque handle to an acquired workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub id: Uuid,
    /// Filesystem root, for runtimes backed by a local directory.
    pub root: Option<PathBuf>,
}

impl WorkspaceHandle {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            root,
        }
    }
}

/// A shell command line run inside the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    pub timeout_secs: u64,
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Isolated, disposable workspaces for building and testing.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn acquire_workspace(&self, snapshot: &RepoSnapshot) -> SandboxResult<WorkspaceHandle>;

    async fn apply_edits(&self, handle: &WorkspaceHandle, edits: &[FileEdit]) -> SandboxResult<()>;

    async fn run_command(
        &self,
        handle: &WorkspaceHandle,
        command: &CommandSpec,
    ) -> SandboxResult<CommandOutput>;

    async fn release(&self, handle: WorkspaceHandle) -> SandboxResult<()>;
}

/// Scoped ownership of a workspace.
///
/// Call [`WorkspaceLease::release`] on normal exit. If the lease is dropped
/// while still holding the handle (timeout, cancellation, panic), release is
/// spawned onto the current runtime.
pub struct WorkspaceLease {
    runtime: Arc<dyn SandboxRuntime>,
    handle: Option<WorkspaceHandle>,
}

impl WorkspaceLease {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, handle: WorkspaceHandle) -> Self {
        Self {
            runtime,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&WorkspaceHandle> {
        self.handle.as_ref()
    }

    pub async fn release(mut self) -> SandboxResult<()> {
        match self.handle.take() {
            Some(handle) => self.runtime.release(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let id = handle.id;
                    if let Err(e) = runtime.release(handle).await {
                        warn!(workspace = %id, error = %e, "deferred workspace release failed");
                    }
                });
            }
            Err(_) => {
                warn!(workspace = %handle.id, "workspace dropped outside a runtime; not released");
            }
        }
    }
}
