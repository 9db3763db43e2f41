// Counters are handed to each component when it is built instead of living in
// a process-wide registry, so two directors in one process (or one test) never
// see each other's numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a replica attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient: overloaded, unreachable or not serving the partition.
    Unavailable,
    /// The replica answered but the answer was unusable. Often version skew.
    ServiceFailure,
}

pub trait Metrics: Send + Sync {
    fn replica_failed(&self, _kind: FailureKind) {}
    fn partition_solved(&self, _elapsed: Duration) {}
    fn partition_timed_out(&self) {}
    fn partition_unsolvable(&self) {}
    fn request_finished(&self, _elapsed: Duration) {}
}

pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

#[derive(Default)]
pub struct CounterMetrics {
    unavailable: AtomicU64,
    service_failures: AtomicU64,
    solved: AtomicU64,
    timed_out: AtomicU64,
    unsolvable: AtomicU64,
    requests: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub unavailable: u64,
    pub service_failures: u64,
    pub solved: u64,
    pub timed_out: u64,
    pub unsolvable: u64,
    pub requests: u64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            unavailable: self.unavailable.load(Ordering::Relaxed),
            service_failures: self.service_failures.load(Ordering::Relaxed),
            solved: self.solved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            unsolvable: self.unsolvable.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for CounterMetrics {
    fn replica_failed(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Unavailable => &self.unavailable,
            FailureKind::ServiceFailure => &self.service_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn partition_solved(&self, _elapsed: Duration) {
        self.solved.fetch_add(1, Ordering::Relaxed);
    }

    fn partition_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    fn partition_unsolvable(&self) {
        self.unsolvable.fetch_add(1, Ordering::Relaxed);
    }

    fn request_finished(&self, _elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}
