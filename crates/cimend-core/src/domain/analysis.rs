//! Provider analyses and the audit trail of provider attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::fix::EditKind;

/// An edit as proposed by a provider, before it is located in the tree.
///
/// `Modify` edits either carry full replacement `content`, or a `find` /
/// `replace` pair where `find` must occur exactly once in the current file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEdit {
    pub path: String,
    pub kind: EditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<String>,
}

impl ProposedEdit {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EditKind::Create,
            content: Some(content.into()),
            find: None,
            replace: None,
        }
    }

    pub fn replace_in(
        path: impl Into<String>,
        find: impl Into<String>,
        replace: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind: EditKind::Modify,
            content: None,
            find: Some(find.into()),
            replace: Some(replace.into()),
        }
    }

    pub fn overwrite(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EditKind::Modify,
            content: Some(content.into()),
            find: None,
            replace: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EditKind::Delete,
            content: None,
            find: None,
            replace: None,
        }
    }
}

/// One provider's diagnosis of a failure. Retained for audit even when the
/// resulting candidate is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub provider: String,
    pub root_cause: String,
    /// Provider-reported confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    pub remediation_steps: Vec<String>,
    pub proposed_edits: Vec<ProposedEdit>,
    pub produced_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(provider: impl Into<String>, root_cause: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            root_cause: root_cause.into(),
            confidence: 0.0,
            remediation_steps: Vec::new(),
            proposed_edits: Vec::new(),
            produced_at: Utc::now(),
        }
    }

    /// Set confidence, clamped to `[0.0, 1.0]`.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.remediation_steps = steps;
        self
    }

    pub fn with_edits(mut self, edits: Vec<ProposedEdit>) -> Self {
        self.proposed_edits = edits;
        self
    }
}

/// How one provider invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// A materialized fix candidate was produced.
    Candidate { candidate_id: Uuid },
    /// The provider did not answer within its timeout.
    Timeout { limit_ms: u64 },
    /// Transport or provider-side error.
    ProviderError { message: String },
    /// The reply could not be turned into an applicable patch.
    Unparsable { reason: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Candidate { .. })
    }
}

/// Audit record for one provider invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttemptRecord {
    pub provider: String,
    /// 1-based attempt number against this provider.
    pub attempt: u32,
    /// Proposing round (1-based) of the owning coordinator.
    pub round: u32,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}
