//! Error types for the fix generator.

use crate::scm::ScmError;

/// Why a provider reply could not become an applicable [`FixCandidate`].
///
/// Every variant is treated by the orchestrator as a failed provider attempt.
///
/// [`FixCandidate`]: crate::domain::fix::FixCandidate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixError {
    #[error("unparsable patch: {0}")]
    UnparsablePatch(String),

    #[error("path escapes the repository tree: {path}")]
    OutsideRepository { path: String },

    #[error("path is protected: {path} (matches {pattern})")]
    Protected { path: String, pattern: String },

    #[error("edit for {path} cannot be located: {reason}")]
    Ambiguous { path: String, reason: String },

    #[error("could not read source tree: {0}")]
    Source(#[from] ScmError),
}
