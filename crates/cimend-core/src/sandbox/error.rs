//! Error types for the sandbox layer.

/// Errors produced by a sandbox runtime or the validation driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("workspace acquisition failed: {0}")]
    Acquire(String),

    #[error("could not apply edits: {0}")]
    Apply(String),

    #[error("command `{command}` could not be executed: {reason}")]
    Exec { command: String, reason: String },

    #[error("command `{command}` timed out after {limit_secs}s")]
    Timeout { command: String, limit_secs: u64 },

    #[error("workspace release failed: {0}")]
    Release(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
