use std::sync::atomic::{AtomicU64, Ordering};

/// Shared budget of iterations across all VUs of an iteration-bounded run.
#[derive(Debug)]
pub struct IterationGate {
    counter: AtomicU64,
    total: u64,
}

impl IterationGate {
    pub fn new(total: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            total,
        }
    }

    /// Claims the next iteration; `false` once the budget is spent.
    pub fn next(&self) -> bool {
        self.counter.fetch_add(1, Ordering::Relaxed) < self.total
    }
}
