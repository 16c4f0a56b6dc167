//! Global atomic counters for Shipway observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at daemon shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    commits_added: AtomicU64,
    branch_updates: AtomicU64,
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    deploys: AtomicU64,
    rollbacks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commits_added: AtomicU64::new(0),
            branch_updates: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            deploys: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn inc_commits_added(&self) {
        self.commits_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_branch_updates(&self) {
        self.branch_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_succeeded(&self) {
        self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deploys(&self) {
        self.deploys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (daemon shutdown, end of a CLI
    /// command) rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            commits_added = self.commits_added(),
            branch_updates = self.branch_updates(),
            runs_started = self.runs_started(),
            runs_succeeded = self.runs_succeeded(),
            runs_failed = self.runs_failed(),
            retries_scheduled = self.retries_scheduled(),
            deploys = self.deploys(),
            rollbacks = self.rollbacks(),
        );
    }

    pub fn commits_added(&self) -> u64 {
        self.commits_added.load(Ordering::Relaxed)
    }

    pub fn branch_updates(&self) -> u64 {
        self.branch_updates.load(Ordering::Relaxed)
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_succeeded(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn deploys(&self) -> u64 {
        self.deploys.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.commits_added.store(0, Ordering::Relaxed);
        self.branch_updates.store(0, Ordering::Relaxed);
        self.runs_started.store(0, Ordering::Relaxed);
        self.runs_succeeded.store(0, Ordering::Relaxed);
        self.runs_failed.store(0, Ordering::Relaxed);
        self.retries_scheduled.store(0, Ordering::Relaxed);
        self.deploys.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
    }
}
