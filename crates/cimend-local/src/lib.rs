//! cimend local sandbox
//!
//! Validates fix candidates against a local checkout:
//! - Copies the checkout into a disposable temporary workspace
//! - Applies the candidate's edits
//! - Runs build and test commands with `sh -c` under a timeout

pub mod runner;
pub mod sandbox;
pub mod workspace;

pub use runner::CommandRunner;
pub use sandbox::{LocalSandbox, LocalSandboxConfig};
