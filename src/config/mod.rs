//! Configuration: schema, loading, validation, and hot reload.

pub mod loader;
pub mod models;
pub mod reload;
pub mod validation;

pub use loader::{load, load_from_str};
pub use models::{
    AdminConfig, AuthConfig, CircuitBreakerConfig, Config, ConnectionPoolConfig, LogOutput,
    LoggingConfig, MetricsConfig, RateLimitConfig, RouteConfig, ServerConfig, TlsConfig,
};
pub use reload::Reloader;
pub use validation::{validate, ValidationError};
