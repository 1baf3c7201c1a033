//! Attempt registry: the single shared map of in-flight remediations.
//!
//! Admission is an atomic check-and-insert keyed by [`RunKey`]; a second
//! admission for a key already in flight is refused. Each entry carries a
//! cancellation channel observed by its coordinator.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::domain::attempt::{AttemptState, Phase};
use crate::domain::run::RunKey;

struct Entry {
    state: AttemptState,
    cancel: watch::Sender<bool>,
}

/// Returned by a successful admission.
#[derive(Debug)]
pub struct AdmissionTicket {
    pub key: RunKey,
    pub attempt_id: Uuid,
    /// Flips to `true` when the attempt is cancelled.
    pub cancelled: watch::Receiver<bool>,
}

#[derive(Default)]
pub struct AttemptRegistry {
    entries: Mutex<HashMap<RunKey, Entry>>,
}

impl AttemptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunKey, Entry>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert a fresh `Collecting` state for `key` unless one exists.
    pub fn try_admit(&self, key: &RunKey) -> Option<AdmissionTicket> {
        let mut entries = self.lock();
        if entries.contains_key(key) {
            return None;
        }
        let state = AttemptState::new(key.clone());
        let attempt_id = state.attempt_id;
        let (cancel, cancelled) = watch::channel(false);
        entries.insert(key.clone(), Entry { state, cancel });
        Some(AdmissionTicket {
            key: key.clone(),
            attempt_id,
            cancelled,
        })
    }

    /// Move `key` to `next`. Illegal transitions are refused and logged.
    pub fn transition(&self, key: &RunKey, attempt_id: Uuid, next: Phase) -> Option<Phase> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(key)
            .filter(|e| e.state.attempt_id == attempt_id)?;
        let from = entry.state.phase;
        if !from.can_transition_to(next) {
            warn!(run = %key, %from, to = %next, "illegal phase transition refused");
            return None;
        }
        entry.state.phase = next;
        entry.state.updated_at = Utc::now();
        Some(from)
    }

    pub fn note_provider(&self, key: &RunKey, attempt_id: Uuid, provider: &str) {
        if let Some(entry) = self
            .lock()
            .get_mut(key)
            .filter(|e| e.state.attempt_id == attempt_id)
        {
            entry.state.note_provider(provider);
        }
    }

    /// Count one more Proposing -> Validating cycle. Returns the new total.
    pub fn increment_attempts(&self, key: &RunKey, attempt_id: Uuid) -> Option<u32> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(key)
            .filter(|e| e.state.attempt_id == attempt_id)?;
        entry.state.total_attempts += 1;
        entry.state.updated_at = Utc::now();
        Some(entry.state.total_attempts)
    }

    pub fn snapshot(&self, key: &RunKey) -> Option<AttemptState> {
        self.lock().get(key).map(|e| e.state.clone())
    }

    pub fn in_flight(&self) -> Vec<AttemptState> {
        let mut states: Vec<AttemptState> = self.lock().values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Signal cancellation. Returns `false` if `key` is not in flight.
    pub fn cancel(&self, key: &RunKey) -> bool {
        match self.lock().get(key) {
            Some(entry) => {
                entry.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `key`, permitting a fresh admission.
    ///
    /// Only the attempt that owns the entry can release it.
    pub fn release(&self, key: &RunKey, attempt_id: Uuid) -> Option<AttemptState> {
        let mut entries = self.lock();
        if entries.get(key).map(|e| e.state.attempt_id) != Some(attempt_id) {
            return None;
        }
        entries.remove(key).map(|e| e.state)
    }
}
