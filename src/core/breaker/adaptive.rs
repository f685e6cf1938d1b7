//! Latency-adaptive threshold layer.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::core::breaker::{Breaker, FailureRateBreaker, State};

/// Adjusts the failure-rate breaker's threshold from an EWMA of observed
/// latency. While the EWMA stays at or below `latency_ceiling` the base
/// threshold applies; between the ceiling and twice the ceiling the
/// threshold interpolates linearly down to `min_threshold`, clamped
/// there. Tighter thresholds make the breaker trip sooner when the
/// backend is already degraded.
pub struct AdaptiveBreaker {
    inner: Arc<FailureRateBreaker>,
    ewma_nanos: Mutex<f64>,
    alpha: f64,
    base_threshold: f64,
    min_threshold: f64,
    latency_ceiling: Duration,
}

impl AdaptiveBreaker {
    pub fn new(
        inner: Arc<FailureRateBreaker>,
        base_threshold: f64,
        min_threshold: f64,
        latency_ceiling: Duration,
        alpha: f64,
    ) -> Self {
        Self {
            inner,
            ewma_nanos: Mutex::new(0.0),
            alpha,
            base_threshold,
            min_threshold,
            latency_ceiling,
        }
    }

    fn update_threshold(&self, latency: Duration) {
        let mut ewma = self.ewma_nanos.lock().expect("adaptive state poisoned");

        let sample = latency.as_nanos() as f64;
        *ewma = if *ewma == 0.0 {
            sample
        } else {
            self.alpha * sample + (1.0 - self.alpha) * *ewma
        };

        let ceiling = self.latency_ceiling.as_nanos() as f64;
        if *ewma <= ceiling {
            self.inner.set_failure_threshold(self.base_threshold);
            return;
        }

        let ratio = ((*ewma - ceiling) / ceiling).min(1.0);
        let threshold = self.base_threshold - ratio * (self.base_threshold - self.min_threshold);
        self.inner.set_failure_threshold(threshold);
    }

    /// Current EWMA in nanoseconds, for tests and the admin API.
    pub fn ewma_nanos(&self) -> f64 {
        *self.ewma_nanos.lock().expect("adaptive state poisoned")
    }
}

impl Breaker for AdaptiveBreaker {
    fn allow(&self) -> bool {
        self.inner.allow()
    }

    fn record_success(&self, latency: Duration) {
        self.inner.record_success(latency);
        self.update_threshold(latency);
    }

    fn record_failure(&self, latency: Duration) {
        self.inner.record_failure(latency);
        self.update_threshold(latency);
    }

    fn state(&self) -> State {
        self.inner.state()
    }

    fn reset(&self) {
        self.inner.reset();
        *self.ewma_nanos.lock().expect("adaptive state poisoned") = 0.0;
        self.inner.set_failure_threshold(self.base_threshold);
    }
}
