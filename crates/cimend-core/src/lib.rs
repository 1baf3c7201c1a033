//! cimend core library
//!
//! Automated CI failure remediation: collect a failed workflow run, classify
//! its failure, ask model providers for a fix, validate the fix in a sandbox
//! and publish it as a pull request.
//!
//! The concrete source-control host, model providers and sandbox runtime are
//! collaborators behind the [`SourceControl`], [`Provider`] and
//! [`SandboxRuntime`] traits; [`fakes`] holds in-memory implementations.

pub mod artifact;
pub mod classifier;
pub mod collector;
pub mod coordinator;
pub mod domain;
pub mod fakes;
pub mod fix;
pub mod metrics;
pub mod obs;
pub mod provider;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod sandbox;
pub mod scm;
pub mod telemetry;

pub use domain::{
    AbortReason, AnalysisResult, AttemptOutcome, AttemptState, CimendError, Conclusion, EditKind,
    FailureDetail, FailureSignal, FileEdit, FixCandidate, JobResult, Phase, ProposedEdit,
    ProviderAttemptRecord, PullRequestRecord, RepoRef, Result, RunKey, RunOutcome, SignalCategory,
    SourceLocation, StepResult, TerminalState, TriggerInfo, ValidationReport, Verdict,
    WorkflowRun,
};

pub use artifact::{read_outcome_artifact, write_outcome_artifact};
pub use classifier::{ClassifierConfig, FailureClassifier, PatternRule, PatternTable};
pub use collector::{CollectError, FailureCollector};
pub use coordinator::{
    Collaborators, CoordinatorConfig, CoordinatorError, RefinementPolicy, RunCoordinator,
    RunStatus, SubmitStatus,
};
pub use fix::{FixError, FixGenerator, FixPolicy};
pub use provider::{
    OrchestratorConfig, OrchestratorError, ProposalRequest, Provider, ProviderError,
    ProviderOrchestrator, ProviderReply, ProviderResult,
};
pub use publisher::{PublishError, PublisherConfig, PullRequestPublisher};
pub use registry::{AdmissionTicket, AttemptRegistry};
pub use retry::BackoffPolicy;
pub use sandbox::{
    CommandOutput, CommandSpec, RepoSnapshot, SandboxError, SandboxResult, SandboxRuntime,
    ValidationConfig, ValidationSandbox, WorkspaceHandle,
};
pub use scm::{
    OpenedPullRequest, PullRequestDraft, RunMetadata, ScmError, SourceControl, SourceView,
};

pub use metrics::METRICS;
pub use obs::RunSpan;
pub use telemetry::init_tracing;

/// cimend version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
