//! Composite breaker: the single surface the proxy interacts with.

use std::{sync::Arc, time::Duration};

use crate::{
    config::CircuitBreakerConfig,
    core::breaker::{
        AdaptiveBreaker, Breaker, BulkheadBreaker, FailureRateBreaker, State, TimeoutBreaker,
    },
};

/// EWMA smoothing factor for the adaptive layer.
const ADAPTIVE_ALPHA: f64 = 0.3;

/// Resolved breaker parameters. The failure-rate core is always active;
/// the other layers participate only when their settings say so.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub reset_timeout: Duration,
    pub half_open_max: u32,
    pub slow_threshold: Option<Duration>,
    pub max_concurrent: usize,
    pub adaptive: bool,
    pub latency_ceiling: Duration,
    pub min_threshold: f64,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            window_size: cfg.window_size,
            failure_threshold: cfg.failure_threshold,
            reset_timeout: cfg.reset_timeout(),
            half_open_max: cfg.half_open_max,
            slow_threshold: cfg.slow_threshold(),
            max_concurrent: cfg.max_concurrent,
            adaptive: cfg.adaptive,
            latency_ceiling: cfg.latency_ceiling(),
            min_threshold: cfg.min_threshold,
        }
    }
}

/// Layered breaker stack for one backend, built once at construction.
/// Composition order (inside → out): failure-rate → adaptive → timeout →
/// bulkhead. `state()` always reports the failure-rate core; `release()`
/// pairs with every successful `allow()` (no-op without a bulkhead).
pub struct CompositeBreaker {
    failure_rate: Arc<FailureRateBreaker>,
    bulkhead: Option<Arc<BulkheadBreaker>>,
    effective: Arc<dyn Breaker>,
}

impl CompositeBreaker {
    pub fn new(backend: impl Into<String>, settings: &BreakerSettings) -> Self {
        let backend = backend.into();
        let failure_rate = Arc::new(FailureRateBreaker::new(
            backend.clone(),
            settings.window_size,
            settings.failure_threshold,
            settings.reset_timeout,
            settings.half_open_max,
        ));

        let mut current: Arc<dyn Breaker> = Arc::clone(&failure_rate) as Arc<dyn Breaker>;

        // The adaptive layer needs the concrete failure-rate core so it
        // can drive set_failure_threshold.
        if settings.adaptive {
            current = Arc::new(AdaptiveBreaker::new(
                Arc::clone(&failure_rate),
                settings.failure_threshold,
                settings.min_threshold,
                settings.latency_ceiling,
                ADAPTIVE_ALPHA,
            ));
        }

        if let Some(slow) = settings.slow_threshold {
            current = Arc::new(TimeoutBreaker::new(current, slow));
        }

        let mut bulkhead = None;
        if settings.max_concurrent > 0 {
            let bh = Arc::new(BulkheadBreaker::new(
                current,
                settings.max_concurrent,
                backend,
            ));
            bulkhead = Some(Arc::clone(&bh));
            current = bh;
        }

        Self {
            failure_rate,
            bulkhead,
            effective: current,
        }
    }

    pub fn allow(&self) -> bool {
        self.effective.allow()
    }

    pub fn record_success(&self, latency: Duration) {
        self.effective.record_success(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.effective.record_failure(latency);
    }

    /// The failure-rate core's state, regardless of layering.
    pub fn state(&self) -> State {
        self.failure_rate.state()
    }

    pub fn reset(&self) {
        self.effective.reset();
    }

    /// Free the bulkhead slot taken by a successful `allow()`. Safe to
    /// call when no bulkhead is configured.
    pub fn release(&self) {
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.release();
        }
    }

    /// Apply new core parameters on hot reload.
    pub fn update_config(&self, settings: &BreakerSettings) {
        self.failure_rate.update_params(
            settings.window_size,
            settings.failure_threshold,
            settings.reset_timeout,
            settings.half_open_max,
        );
    }
}
