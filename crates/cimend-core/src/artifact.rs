//! Terminal outcome persistence.
//!
//! Outcomes are written to `<dir>/<owner>/<name>/<run_id>/outcome.json` with
//! a companion `outcome.digest` holding the SHA-256 of the outcome's
//! canonical JSON, checked again on load.

use std::path::{Path, PathBuf};

use crate::domain::digest::digest_of;
use crate::domain::outcome::RunOutcome;
use crate::domain::run::RunKey;
use crate::domain::{CimendError, Result};

fn run_dir(key: &RunKey, dir: &Path) -> PathBuf {
    dir.join(&key.repo.owner)
        .join(&key.repo.name)
        .join(key.run_id.to_string())
}

/// Write `outcome` and its digest. Returns the path to `outcome.json`.
pub fn write_outcome_artifact(outcome: &RunOutcome, dir: &Path) -> Result<PathBuf> {
    let run_dir = run_dir(&outcome.key, dir);
    std::fs::create_dir_all(&run_dir)?;

    let outcome_path = run_dir.join("outcome.json");
    let digest_path = run_dir.join("outcome.digest");

    let digest = digest_of(outcome)?;
    let json = serde_json::to_vec_pretty(outcome)?;
    std::fs::write(&outcome_path, &json)?;
    std::fs::write(&digest_path, digest.as_bytes())?;

    Ok(outcome_path)
}

/// Read and verify the outcome stored for `key`.
///
/// Returns [`CimendError::DigestMismatch`] if the content no longer matches
/// the stored digest.
pub fn read_outcome_artifact(key: &RunKey, dir: &Path) -> Result<RunOutcome> {
    let run_dir = run_dir(key, dir);
    let json = std::fs::read(run_dir.join("outcome.json"))?;
    let expected = std::fs::read_to_string(run_dir.join("outcome.digest"))?;

    let outcome: RunOutcome = serde_json::from_slice(&json)?;
    let actual = digest_of(&outcome)?;
    if actual != expected.trim() {
        return Err(CimendError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(outcome)
}
