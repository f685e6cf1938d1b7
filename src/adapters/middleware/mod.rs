//! The middleware stack.
//!
//! Each middleware is an axum `from_fn` layer built by a `create_*`
//! factory that captures its dependencies. Assembly order (outermost
//! first) is fixed by the gateway builder: Recovery → RequestID →
//! Deadline → SecurityHeaders → Logging → CORS → BodyLimit → RateLimit →
//! Auth → Router.

pub mod auth;
pub mod body_limit;
pub mod cors;
pub mod deadline;
pub mod logging;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod security;

pub use auth::create_auth_middleware;
pub use body_limit::create_body_limit_middleware;
pub use cors::{create_cors_middleware, CorsSettings};
pub use deadline::create_deadline_middleware;
pub use logging::{create_logging_middleware, BodyLogSettings, LogLevelTable, RouteLogLevel};
pub use rate_limit::create_rate_limit_middleware;
pub use recovery::recovery_middleware;
pub use request_id::{request_id_middleware, RequestId};
pub use security::create_security_headers_middleware;
