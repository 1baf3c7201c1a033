//! Domain models for cimend.
//!
//! Canonical definitions for the core entities:
//! - `WorkflowRun`: a fetched, failing CI run
//! - `FailureSignal`: categorized extraction from failure evidence
//! - `AnalysisResult`: one provider's diagnosis
//! - `FixCandidate`: a concrete, unapplied set of edits
//! - `ValidationReport`: sandbox verdict for one candidate
//! - `PullRequestRecord`: the published change
//! - `AttemptState` / `RunOutcome`: live and terminal coordinator state

pub mod analysis;
pub mod attempt;
pub mod digest;
pub mod error;
pub mod fix;
pub mod outcome;
pub mod publish;
pub mod run;
pub mod signal;
pub mod validation;

pub use analysis::{AnalysisResult, AttemptOutcome, ProposedEdit, ProviderAttemptRecord};
pub use attempt::{AttemptState, Phase};
pub use error::{CimendError, Result};
pub use fix::{EditKind, FileEdit, FixCandidate};
pub use outcome::{AbortReason, RunOutcome, TerminalState};
pub use publish::PullRequestRecord;
pub use run::{Conclusion, JobResult, RepoRef, RunKey, StepResult, TriggerInfo, WorkflowRun};
pub use signal::{FailureSignal, SignalCategory, SourceLocation};
pub use validation::{FailureDetail, ValidationReport, Verdict};
