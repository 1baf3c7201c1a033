//! Domain-level error taxonomy for cimend.

/// cimend domain errors.
///
/// Component failures (collector, orchestrator, sandbox, publisher) have
/// their own error enums next to the component; this type covers faults
/// that are not part of any remediation decision.
#[derive(Debug, thiserror::Error)]
pub enum CimendError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid repository coordinates: {0}")]
    InvalidRepository(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("non-canonical value: {0}")]
    NonCanonical(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cimend domain operations.
pub type Result<T> = std::result::Result<T, CimendError>;
