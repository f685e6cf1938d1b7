//! Slow-call reclassification layer.

use std::{sync::Arc, time::Duration};

use crate::core::breaker::{Breaker, State};

/// Wraps another breaker and treats slow responses as failures: a
/// success whose latency exceeds `slow_threshold` is recorded as a
/// failure on the inner breaker.
pub struct TimeoutBreaker {
    inner: Arc<dyn Breaker>,
    slow_threshold: Duration,
}

impl TimeoutBreaker {
    pub fn new(inner: Arc<dyn Breaker>, slow_threshold: Duration) -> Self {
        Self {
            inner,
            slow_threshold,
        }
    }
}

impl Breaker for TimeoutBreaker {
    fn allow(&self) -> bool {
        self.inner.allow()
    }

    fn record_success(&self, latency: Duration) {
        if latency > self.slow_threshold {
            self.inner.record_failure(latency);
        } else {
            self.inner.record_success(latency);
        }
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
