//! Error types for language-model backends and the orchestrator.

/// Failure of a single provider invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout { .. }
            | ProviderError::Transport(_)
            | ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::MalformedResponse(_) | ProviderError::Config(_) => false,
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Errors from [`ProviderOrchestrator::analyze_and_propose`].
///
/// [`ProviderOrchestrator::analyze_and_propose`]: super::ProviderOrchestrator::analyze_and_propose
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("all providers exhausted (tried: {})", tried.join(", "))]
    AllProvidersExhausted { tried: Vec<String> },

    #[error("no providers configured")]
    NoProviders,
}
