//! Adapters: the I/O-facing implementations around the core.

pub mod admin;
pub mod health;
pub mod http_client;
pub mod middleware;
pub mod proxy;
pub mod tls;

pub use admin::{admin_router, AdminState};
pub use health::HealthState;
pub use http_client::PooledHttpClient;
pub use proxy::ProxyRouter;
pub use tls::CertLoader;
