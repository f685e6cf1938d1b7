//! The backend HTTP client port.
//!
//! The proxy engine and readiness prober talk to backends through this
//! trait so tests can script upstream behavior without sockets.

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

/// Failure talking to a backend. Transport-level only; an HTTP error
/// status from the backend is a successful send.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HttpClientError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Sends one request to the named backend. `backend` is the route's
/// backend URL and selects the per-backend connection pool; the request
/// URI is already rewritten to point at it.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send_request(
        &self,
        backend: &str,
        req: Request<Body>,
    ) -> HttpClientResult<Response<Body>>;
}
