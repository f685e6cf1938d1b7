//! Composable circuit breakers protecting backends from failure and
//! load spikes.
//!
//! Each layer implements the small [`Breaker`] capability and wraps an
//! inner breaker by composition. The stack is built once per backend by
//! [`composite::CompositeBreaker`] and the outermost layer is the only
//! surface the proxy touches.

pub mod adaptive;
pub mod bulkhead;
pub mod composite;
pub mod failure_rate;
pub mod timeout;

pub use adaptive::AdaptiveBreaker;
pub use bulkhead::BulkheadBreaker;
pub use composite::{BreakerSettings, CompositeBreaker};
pub use failure_rate::FailureRateBreaker;
pub use timeout::TimeoutBreaker;

use std::time::Duration;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Normal operation; requests pass through.
    Closed,
    /// Failing; requests are rejected immediately.
    Open,
    /// Probing; limited requests allowed to test recovery.
    HalfOpen,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }

    /// Gauge encoding: 0=closed, 1=open, 2=half-open.
    pub fn as_gauge(self) -> u8 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability every breaker layer implements.
pub trait Breaker: Send + Sync {
    /// Whether a request may proceed. False means reject with 503 (or
    /// the route's fallback).
    fn allow(&self) -> bool;

    /// Record a successful backend response with its latency.
    fn record_success(&self, latency: Duration);

    /// Record a failed backend response with its latency.
    fn record_failure(&self, latency: Duration);

    /// Current state.
    fn state(&self) -> State;

    /// Force the breaker back to closed.
    fn reset(&self);
}
