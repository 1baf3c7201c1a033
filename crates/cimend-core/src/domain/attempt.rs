//! Per-run attempt state tracked by the coordinator registry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::RunKey;

/// Coordinator phase.
///
/// ```text
/// Collecting -> Classifying -> Proposing -> Validating -> (Refining -> Proposing)*
///            -> Publishing -> {Published, Exhausted, Aborted}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Collecting,
    Classifying,
    Proposing,
    Validating,
    Refining,
    Publishing,
    Published,
    Exhausted,
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Published | Phase::Exhausted | Phase::Aborted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        // Any non-terminal phase may abort (cancellation at a suspension point).
        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Collecting, Classifying)
                | (Classifying, Proposing)
                | (Proposing, Validating)
                | (Validating, Publishing)
                | (Validating, Refining)
                | (Validating, Exhausted)
                | (Refining, Proposing)
                | (Publishing, Published)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Collecting => "collecting",
            Phase::Classifying => "classifying",
            Phase::Proposing => "proposing",
            Phase::Validating => "validating",
            Phase::Refining => "refining",
            Phase::Publishing => "publishing",
            Phase::Published => "published",
            Phase::Exhausted => "exhausted",
            Phase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Live state of one in-flight remediation. At most one exists per [`RunKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptState {
    pub key: RunKey,
    pub attempt_id: Uuid,
    pub phase: Phase,
    /// Providers invoked so far, in first-invocation order.
    pub providers_tried: Vec<String>,
    /// Completed Proposing -> Validating cycles.
    pub total_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttemptState {
    pub fn new(key: RunKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            attempt_id: Uuid::new_v4(),
            phase: Phase::Collecting,
            providers_tried: Vec::new(),
            total_attempts: 0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn note_provider(&mut self, provider: &str) {
        if !self.providers_tried.iter().any(|p| p == provider) {
            self.providers_tried.push(provider.to_string());
        }
        self.updated_at = Utc::now();
    }
}
