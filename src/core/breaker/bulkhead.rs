//! Concurrency-capping bulkhead layer.

use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;

use crate::{
    core::breaker::{Breaker, State},
    metrics,
};

/// Limits in-flight requests to a backend with a counting semaphore.
/// Acquisition never blocks: at the limit the request is shed, which is
/// the desired behavior. Every `allow()` that returns true must be paired
/// with exactly one [`BulkheadBreaker::release`].
pub struct BulkheadBreaker {
    inner: Arc<dyn Breaker>,
    semaphore: Semaphore,
    max_concurrent: usize,
    backend: String,
}

impl BulkheadBreaker {
    pub fn new(inner: Arc<dyn Breaker>, max_concurrent: usize, backend: impl Into<String>) -> Self {
        Self {
            inner,
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
            backend: backend.into(),
        }
    }

    /// Free a concurrency slot after a request completes.
    pub fn release(&self) {
        self.semaphore.add_permits(1);
        metrics::set_bulkhead_in_flight(&self.backend, self.in_flight());
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }
}

impl Breaker for BulkheadBreaker {
    fn allow(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                // The slot is returned through release(), not permit drop.
                permit.forget();
                metrics::set_bulkhead_in_flight(&self.backend, self.in_flight());
                if !self.inner.allow() {
                    // Inner breaker rejected: give the slot back now.
                    self.semaphore.add_permits(1);
                    metrics::set_bulkhead_in_flight(&self.backend, self.in_flight());
                    return false;
                }
                true
            }
            Err(_) => {
                metrics::record_bulkhead_rejection(&self.backend);
                false
            }
        }
    }

    fn record_success(&self, latency: Duration) {
        self.inner.record_success(latency);
    }

    fn record_failure(&self, latency: Duration) {
        self.inner.record_failure(latency);
    }

    fn state(&self) -> State {
        self.inner.state()
    }

    fn reset(&self) {
        self.inner.reset();
    }
}
