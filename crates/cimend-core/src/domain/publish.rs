//! Pull request records: the terminal artifact of a successful attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::RunKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub branch: String,
    pub commit_sha: String,
    pub number: u64,
    pub url: String,
    pub run: RunKey,
    pub candidate_id: Uuid,
    pub candidate_digest: String,
    pub created_at: DateTime<Utc>,
}
