//! Fix candidates: concrete, unapplied sets of file edits.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::analysis::AnalysisResult;
use crate::domain::digest::digest_of;
use crate::domain::error::Result;

/// Kind of file-level edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Create,
    Modify,
    Delete,
}

/// A file edit resolved against the current source tree.
///
/// `content` is the full new file content for `Create`/`Modify` and `None`
/// for `Delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub kind: EditKind,
    pub content: Option<String>,
}

impl FileEdit {
    pub fn write(path: impl Into<String>, kind: EditKind, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            content: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EditKind::Delete,
            content: None,
        }
    }
}

/// A concrete remedy proposed for one coordinator attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixCandidate {
    pub id: Uuid,
    /// Ordered edits; applied in order.
    pub edits: Vec<FileEdit>,
    pub rationale: String,
    pub analysis: AnalysisResult,
    /// SHA-256 over the canonical JSON of `edits`.
    pub digest: String,
}

impl FixCandidate {
    pub fn new(edits: Vec<FileEdit>, rationale: String, analysis: AnalysisResult) -> Result<Self> {
        let digest = digest_of(&edits)?;
        Ok(Self {
            id: Uuid::new_v4(),
            edits,
            rationale,
            analysis,
            digest,
        })
    }

    /// Recompute the digest and compare with the stored one.
    pub fn verify_digest(&self) -> Result<bool> {
        Ok(digest_of(&self.edits)? == self.digest)
    }

    /// Paths touched by this candidate, in edit order.
    pub fn touched_paths(&self) -> Vec<&str> {
        self.edits.iter().map(|e| e.path.as_str()).collect()
    }

    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}
