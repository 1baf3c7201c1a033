//! Fix generator: turns an [`AnalysisResult`] into an applicable [`FixCandidate`].
//!
//! Edits are resolved against the current source tree into whole-file
//! contents. The generator reads through a [`SourceView`] but never writes;
//! the result is a description of edits only.
//!
//! Rejected:
//! - paths outside the repository tree (absolute, `..`, `.git`)
//! - paths matching a protected glob
//! - edits that cannot be located unambiguously (missing file, `find` text
//!   absent or occurring more than once, creating an existing file)
//! - replies with no effective change

pub mod error;
pub mod parse;
pub mod paths;

use serde::{Deserialize, Serialize};

use crate::domain::analysis::{AnalysisResult, ProposedEdit};
use crate::domain::fix::{EditKind, FileEdit, FixCandidate};
use crate::scm::SourceView;

pub use error::FixError;
pub use parse::parse_reply_text;
pub use paths::{default_protected_globs, glob_match, normalize_repo_path};

/// Fix generator policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPolicy {
    /// Globs that must never be edited.
    pub protected_globs: Vec<String>,
    /// Maximum number of distinct files one candidate may touch.
    pub max_files: usize,
}

impl Default for FixPolicy {
    fn default() -> Self {
        Self {
            protected_globs: default_protected_globs(),
            max_files: 20,
        }
    }
}

/// Working content of one path while edits are resolved in order.
#[derive(Debug, Clone)]
struct Working {
    path: String,
    original: Option<String>,
    current: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FixGenerator {
    policy: FixPolicy,
}

impl FixGenerator {
    pub fn new(policy: FixPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FixPolicy {
        &self.policy
    }

    fn check_protected(&self, path: &str) -> Result<(), FixError> {
        match self
            .policy
            .protected_globs
            .iter()
            .find(|g| glob_match(g, path))
        {
            Some(pattern) => Err(FixError::Protected {
                path: path.to_string(),
                pattern: pattern.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Resolve the analysis' proposed edits into a candidate.
    pub async fn materialize(
        &self,
        analysis: &AnalysisResult,
        source: &dyn SourceView,
    ) -> Result<FixCandidate, FixError> {
        if analysis.proposed_edits.is_empty() {
            return Err(FixError::UnparsablePatch(
                "reply contained no edits".to_string(),
            ));
        }

        let mut working: Vec<Working> = Vec::new();
        for edit in &analysis.proposed_edits {
            let path = normalize_repo_path(&edit.path)?;
            self.check_protected(&path)?;

            let idx = match working.iter().position(|w| w.path == path) {
                Some(idx) => idx,
                None => {
                    if working.len() >= self.policy.max_files {
                        return Err(FixError::UnparsablePatch(format!(
                            "candidate touches more than {} files",
                            self.policy.max_files
                        )));
                    }
                    let original = source.read_file(&path).await?;
                    working.push(Working {
                        path: path.clone(),
                        current: original.clone(),
                        original,
                    });
                    working.len() - 1
                }
            };
            apply_edit(&mut working[idx], edit)?;
        }

        let edits: Vec<FileEdit> = working
            .into_iter()
            .filter_map(|w| match (w.original, w.current) {
                (None, Some(content)) => Some(FileEdit::write(w.path, EditKind::Create, content)),
                (Some(before), Some(after)) if before != after => {
                    Some(FileEdit::write(w.path, EditKind::Modify, after))
                }
                (Some(_), None) => Some(FileEdit::delete(w.path)),
                _ => None,
            })
            .collect();

        if edits.is_empty() {
            return Err(FixError::UnparsablePatch(
                "edits do not change any file".to_string(),
            ));
        }

        let rationale = if analysis.remediation_steps.is_empty() {
            analysis.root_cause.clone()
        } else {
            analysis
                .remediation_steps
                .iter()
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        FixCandidate::new(edits, rationale, analysis.clone())
            .map_err(|e| FixError::UnparsablePatch(e.to_string()))
    }
}

fn apply_edit(w: &mut Working, edit: &ProposedEdit) -> Result<(), FixError> {
    let ambiguous = |reason: &str| FixError::Ambiguous {
        path: w.path.clone(),
        reason: reason.to_string(),
    };

    match edit.kind {
        EditKind::Create => {
            if w.current.is_some() {
                return Err(ambiguous("create requested but the file already exists"));
            }
            let content = edit.content.clone().ok_or_else(|| {
                FixError::UnparsablePatch(format!("create of {} has no content", w.path))
            })?;
            w.current = Some(content);
        }
        EditKind::Delete => {
            if w.current.is_none() {
                return Err(ambiguous("delete requested but the file does not exist"));
            }
            w.current = None;
        }
        EditKind::Modify => {
            let Some(current) = w.current.as_ref() else {
                return Err(ambiguous("modify requested but the file does not exist"));
            };
            let updated = match (&edit.content, &edit.find, &edit.replace) {
                (Some(content), None, _) => content.clone(),
                (None, Some(find), Some(replace)) => {
                    if find.is_empty() {
                        return Err(ambiguous("empty find text"));
                    }
                    match current.matches(find.as_str()).count() {
                        1 => current.replacen(find.as_str(), replace, 1),
                        0 => return Err(ambiguous("find text not present in file")),
                        n => {
                            return Err(ambiguous(&format!("find text occurs {n} times")));
                        }
                    }
                }
                _ => {
                    return Err(FixError::UnparsablePatch(format!(
                        "modify of {} needs either content or find/replace",
                        w.path
                    )))
                }
            };
            w.current = Some(updated);
        }
    }
    Ok(())
}
