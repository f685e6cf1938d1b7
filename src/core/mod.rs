//! Core gateway logic: routing, rate limiting, authentication, and the
//! circuit-breaker stack. No I/O lives here; everything is driven by the
//! adapters.

pub mod auth;
pub mod breaker;
pub mod rate_limit;
pub mod routing;

pub use auth::{Claims, TokenValidator};
pub use breaker::{BreakerSettings, CompositeBreaker};
pub use rate_limit::{Decision, RateLimiter};
pub use routing::{matches_prefix, RouteTable};
