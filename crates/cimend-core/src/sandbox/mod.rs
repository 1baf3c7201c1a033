//! Validation sandbox: build and test a fix candidate in isolation.
//!
//! # Modules
//!
//! - [`runtime`]: `SandboxRuntime` collaborator contract, `WorkspaceLease`
//! - [`validate`]: `ValidationSandbox`, `ValidationConfig`
//! - [`report`]: test-count and coverage extraction
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod error;
pub mod report;
pub mod runtime;
pub mod validate;

pub use error::{SandboxError, SandboxResult};
pub use report::{parse_coverage, parse_test_counts, TestCounts};
pub use runtime::{
    CommandOutput, CommandSpec, RepoSnapshot, SandboxRuntime, WorkspaceHandle, WorkspaceLease,
};
pub use validate::{ValidationConfig, ValidationSandbox};
