//! Global atomic counters for remediation runs.
//!
//! Counters are incremented at the call site; [`Metrics::flush`] emits the
//! current values as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub runs_admitted: u64,
    pub runs_duplicate: u64,
    pub runs_published: u64,
    pub runs_exhausted: u64,
    pub runs_aborted: u64,
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub validations_run: u64,
    pub validations_passed: u64,
}

pub struct Metrics {
    runs_admitted: AtomicU64,
    runs_duplicate: AtomicU64,
    runs_published: AtomicU64,
    runs_exhausted: AtomicU64,
    runs_aborted: AtomicU64,
    provider_calls: AtomicU64,
    provider_failures: AtomicU64,
    validations_run: AtomicU64,
    validations_passed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric = name, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_admitted: AtomicU64::new(0),
            runs_duplicate: AtomicU64::new(0),
            runs_published: AtomicU64::new(0),
            runs_exhausted: AtomicU64::new(0),
            runs_aborted: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
            provider_failures: AtomicU64::new(0),
            validations_run: AtomicU64::new(0),
            validations_passed: AtomicU64::new(0),
        }
    }

    pub fn inc_admitted(&self) {
        bump(&self.runs_admitted, "runs_admitted");
    }

    pub fn inc_duplicate(&self) {
        bump(&self.runs_duplicate, "runs_duplicate");
    }

    pub fn inc_published(&self) {
        bump(&self.runs_published, "runs_published");
    }

    pub fn inc_exhausted(&self) {
        bump(&self.runs_exhausted, "runs_exhausted");
    }

    pub fn inc_aborted(&self) {
        bump(&self.runs_aborted, "runs_aborted");
    }

    /// Record one provider invocation and whether it failed.
    pub fn record_provider_call(&self, failed: bool) {
        bump(&self.provider_calls, "provider_calls");
        if failed {
            bump(&self.provider_failures, "provider_failures");
        }
    }

    /// Record one finished validation.
    pub fn record_validation(&self, passed: bool) {
        bump(&self.validations_run, "validations_run");
        if passed {
            bump(&self.validations_passed, "validations_passed");
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_admitted: self.runs_admitted.load(Ordering::Relaxed),
            runs_duplicate: self.runs_duplicate.load(Ordering::Relaxed),
            runs_published: self.runs_published.load(Ordering::Relaxed),
            runs_exhausted: self.runs_exhausted.load(Ordering::Relaxed),
            runs_aborted: self.runs_aborted.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            validations_run: self.validations_run.load(Ordering::Relaxed),
            validations_passed: self.validations_passed.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (end of a CLI run, watch tick).
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            runs_admitted = s.runs_admitted,
            runs_duplicate = s.runs_duplicate,
            runs_published = s.runs_published,
            runs_exhausted = s.runs_exhausted,
            runs_aborted = s.runs_aborted,
            provider_calls = s.provider_calls,
            provider_failures = s.provider_failures,
            validations_run = s.validations_run,
            validations_passed = s.validations_passed,
        );
    }
}
