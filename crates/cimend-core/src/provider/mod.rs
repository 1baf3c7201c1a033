//! Language-model backends and the orchestration across them.
//!
//! Every backend implements the single [`Provider`] capability: given a
//! [`ProposalRequest`], return a root-cause summary plus proposed edits.
//! The [`ProviderOrchestrator`] selects among backends purely by their
//! configured priority order.

pub mod error;
pub mod orchestrator;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::analysis::{AnalysisResult, ProposedEdit};
use crate::domain::run::RunKey;
use crate::domain::signal::FailureSignal;
use crate::domain::validation::ValidationReport;

pub use error::{OrchestratorError, ProviderError, ProviderResult};
pub use orchestrator::{
    OrchestratorConfig, ProposalAudit, ProposalContext, ProviderCursor, ProviderOrchestrator,
};
pub use prompt::{build_prompt, SYSTEM_PROMPT};

/// Structured answer expected from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub root_cause: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub remediation_steps: Vec<String>,
    #[serde(default)]
    pub edits: Vec<ProposedEdit>,
}

impl ProviderReply {
    pub fn into_analysis(self, provider: &str) -> AnalysisResult {
        AnalysisResult::new(provider, self.root_cause)
            .with_confidence(self.confidence)
            .with_steps(self.remediation_steps)
            .with_edits(self.edits)
    }
}

/// Context handed to a backend for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub run: RunKey,
    /// Fully rendered user prompt.
    pub prompt: String,
    pub signals: Vec<FailureSignal>,
    /// Failing report of the previous round, present on refinement.
    pub previous: Option<ValidationReport>,
    /// Coordinator round (1-based).
    pub round: u32,
    /// Attempt number against this provider (1-based).
    pub attempt: u32,
}

/// A language-model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used in audit records.
    fn name(&self) -> &str;

    async fn propose(&self, request: &ProposalRequest) -> ProviderResult<ProviderReply>;
}
