use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Sink for host-observed execution time, shared with the caller.
#[derive(Debug, Default)]
pub struct ExecutionProfile {
    compute_time_ns: AtomicU64,
    executions: AtomicU64,
}

impl ExecutionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute_time_ns(&self) -> u64 {
        self.compute_time_ns.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Records the time since `start`; never less than one nanosecond.
    pub fn record_since(&self, start: Instant) {
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.compute_time_ns.store(nanos.max(1), Ordering::Relaxed);
        self.executions.fetch_add(1, Ordering::Relaxed);
    }
}
