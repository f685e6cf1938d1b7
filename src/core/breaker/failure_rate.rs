//! Sliding-window failure-rate breaker: the core of every composite.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{
    core::breaker::{Breaker, State},
    metrics,
};

/// Opens when the failure ratio over the most recent `window_size`
/// outcomes reaches `failure_threshold`. Evaluated only after recording
/// a failure and only once the window is full.
pub struct FailureRateBreaker {
    backend: String,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,

    // Sliding window as a ring buffer of failed-flags.
    window: Vec<bool>,
    head: usize,
    count: usize,
    failures: usize,

    failure_threshold: f64,
    reset_timeout: Duration,
    half_open_max: u32,

    half_open_success: u32,
    opened_at: Option<Instant>,
}

impl FailureRateBreaker {
    pub fn new(
        backend: impl Into<String>,
        window_size: usize,
        failure_threshold: f64,
        reset_timeout: Duration,
        half_open_max: u32,
    ) -> Self {
        Self {
            backend: backend.into(),
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: vec![false; window_size],
                head: 0,
                count: 0,
                failures: 0,
                failure_threshold,
                reset_timeout,
                half_open_max,
                half_open_success: 0,
                opened_at: None,
            }),
        }
    }

    /// Dynamically update the failure threshold. Used by the adaptive
    /// layer to tighten or relax the trip point at runtime.
    pub fn set_failure_threshold(&self, threshold: f64) {
        self.inner.lock().expect("breaker poisoned").failure_threshold = threshold;
    }

    /// Apply new parameters on hot reload. The window is resized (and
    /// cleared) only when its size actually changes.
    pub fn update_params(
        &self,
        window_size: usize,
        failure_threshold: f64,
        reset_timeout: Duration,
        half_open_max: u32,
    ) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.failure_threshold = failure_threshold;
        inner.reset_timeout = reset_timeout;
        inner.half_open_max = half_open_max;
        if window_size != inner.window.len() {
            inner.window = vec![false; window_size];
            inner.head = 0;
            inner.count = 0;
            inner.failures = 0;
        }
    }

    /// Window occupancy and failure count, for the admin API and tests.
    pub fn window_stats(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("breaker poisoned");
        (inner.count, inner.failures)
    }
}

impl Inner {
    fn record_outcome(&mut self, failed: bool) {
        // Window full: evict the oldest slot first.
        if self.count == self.window.len() {
            if self.window[self.head] {
                self.failures -= 1;
            }
        } else {
            self.count += 1;
        }

        self.window[self.head] = failed;
        if failed {
            self.failures += 1;
        }
        self.head = (self.head + 1) % self.window.len();
    }

    fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failures as f64 / self.count as f64
        }
    }

    fn transition_to(&mut self, backend: &str, new_state: State) {
        if self.state == new_state {
            return;
        }
        let from = self.state;
        self.state = new_state;

        metrics::record_breaker_transition(backend, from.as_str(), new_state.as_str());
        metrics::set_breaker_state(backend, new_state.as_gauge());
        tracing::info!(
            backend = %backend,
            from = from.as_str(),
            to = new_state.as_str(),
            "circuit breaker state change"
        );

        match new_state {
            State::Closed => {
                self.head = 0;
                self.count = 0;
                self.failures = 0;
                self.half_open_success = 0;
            }
            State::Open => {
                self.opened_at = Some(Instant::now());
                self.half_open_success = 0;
            }
            State::HalfOpen => {
                self.half_open_success = 0;
            }
        }
    }
}

impl Breaker for FailureRateBreaker {
    fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= inner.reset_timeout {
                    inner.transition_to(&self.backend, State::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, _latency: Duration) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            State::Closed => inner.record_outcome(false),
            State::HalfOpen => {
                inner.half_open_success += 1;
                if inner.half_open_success >= inner.half_open_max {
                    inner.transition_to(&self.backend, State::Closed);
                }
            }
            State::Open => {}
        }
    }

    fn record_failure(&self, _latency: Duration) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            State::Closed => {
                inner.record_outcome(true);
                if inner.count >= inner.window.len()
                    && inner.failure_rate() >= inner.failure_threshold
                {
                    inner.transition_to(&self.backend, State::Open);
                }
            }
            State::HalfOpen => inner.transition_to(&self.backend, State::Open),
            State::Open => {}
        }
    }

    fn state(&self) -> State {
        self.inner.lock().expect("breaker poisoned").state
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.transition_to(&self.backend, State::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAT: Duration = Duration::from_millis(1);

    fn breaker(window: usize, threshold: f64, reset: Duration, half_open_max: u32) -> FailureRateBreaker {
        FailureRateBreaker::new("http://backend:1", window, threshold, reset, half_open_max)
    }

    #[test]
    fn stays_closed_below_threshold() {
        let b = breaker(4, 0.5, Duration::from_secs(30), 2);
        b.record_failure(LAT);
        b.record_success(LAT);
        b.record_success(LAT);
        b.record_success(LAT);
        assert_eq!(b.state(), State::Closed);
        assert!(b.allow());
    }

    #[test]
    fn trips_open_when_window_full_and_rate_reached() {
        // Outcomes S,F,S,F over a window of 4 with threshold 0.5 → Open.
        let b = breaker(4, 0.5, Duration::from_secs(30), 2);
        b.record_success(LAT);
        b.record_failure(LAT);
        b.record_success(LAT);
        assert_eq!(b.state(), State::Closed);
        b.record_failure(LAT);
        assert_eq!(b.state(), State::Open);
        assert!(!b.allow());
    }

    #[test]
    fn does_not_trip_before_window_is_full() {
        let b = breaker(4, 0.5, Duration::from_secs(30), 2);
        b.record_failure(LAT);
        b.record_failure(LAT);
        b.record_failure(LAT);
        assert_eq!(b.state(), State::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_reset_timeout() {
        let b = breaker(2, 0.5, Duration::from_millis(10), 2);
        b.record_failure(LAT);
        b.record_failure(LAT);
        assert_eq!(b.state(), State::Open);
        assert!(!b.allow());

        std::thread::sleep(Duration::from_millis(20));
        assert!(b.allow());
        assert_eq!(b.state(), State::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let b = breaker(2, 0.5, Duration::from_millis(5), 2);
        b.record_failure(LAT);
        b.record_failure(LAT);
        std::thread::sleep(Duration::from_millis(10));
        assert!(b.allow());

        b.record_success(LAT);
        assert_eq!(b.state(), State::HalfOpen);
        b.record_success(LAT);
        assert_eq!(b.state(), State::Closed);

        // Closing resets the window.
        let (count, failures) = b.window_stats();
        assert_eq!((count, failures), (0, 0));
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(2, 0.5, Duration::from_millis(5), 2);
        b.record_failure(LAT);
        b.record_failure(LAT);
        std::thread::sleep(Duration::from_millis(10));
        assert!(b.allow());
        assert_eq!(b.state(), State::HalfOpen);

        b.record_failure(LAT);
        assert_eq!(b.state(), State::Open);
        assert!(!b.allow());
    }

    #[test]
    fn window_invariants_hold_under_arbitrary_sequences() {
        let b = breaker(8, 0.99, Duration::from_secs(30), 2);
        // Deterministic pseudo-random outcome stream.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..1000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if seed % 3 == 0 {
                b.record_failure(LAT);
            } else {
                b.record_success(LAT);
            }
            let (count, failures) = b.window_stats();
            assert!(failures <= count, "failures {failures} > count {count}");
            assert!(count <= 8, "count {count} exceeds window");
        }
    }

    #[test]
    fn eviction_decrements_failures() {
        let b = breaker(2, 1.0, Duration::from_secs(30), 2);
        b.record_failure(LAT);
        b.record_success(LAT);
        // Window now [F,S]; the next success evicts the failure.
        b.record_success(LAT);
        let (count, failures) = b.window_stats();
        assert_eq!(count, 2);
        assert_eq!(failures, 0);
    }

    #[test]
    fn reset_forces_closed() {
        let b = breaker(2, 0.5, Duration::from_secs(30), 2);
        b.record_failure(LAT);
        b.record_failure(LAT);
        assert_eq!(b.state(), State::Open);
        b.reset();
        assert_eq!(b.state(), State::Closed);
        assert!(b.allow());
    }

    #[test]
    fn update_params_resizes_and_clears_window() {
        let b = breaker(4, 0.5, Duration::from_secs(30), 2);
        b.record_failure(LAT);
        b.update_params(8, 0.6, Duration::from_secs(10), 3);
        let (count, failures) = b.window_stats();
        assert_eq!((count, failures), (0, 0));

        // Same size: window content preserved.
        b.record_failure(LAT);
        b.update_params(8, 0.7, Duration::from_secs(10), 3);
        let (count, failures) = b.window_stats();
        assert_eq!((count, failures), (1, 1));
    }
}
