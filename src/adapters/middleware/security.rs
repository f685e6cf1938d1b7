//! Security response headers.

use std::{future::Future, pin::Pin};

use axum::{
    extract::Request,
    http::{HeaderValue},
    middleware::Next,
    response::Response,
};

/// Always sets the standard hardening headers. HSTS is added only when
/// the request arrived over TLS (the gateway terminated it) or carries
/// `X-Forwarded-Proto: https` from an upstream terminator.
pub async fn security_headers_middleware(
    tls_terminated: bool,
    req: Request,
    next: Next,
) -> Response {
    let https = tls_terminated
        || req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            == Some("https");

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-XSS-Protection", HeaderValue::from_static("0"));

    if https {
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    response
}

/// Cloneable closure wrapping [`security_headers_middleware`].
pub fn create_security_headers_middleware(
    tls_terminated: bool,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| Box::pin(security_headers_middleware(tls_terminated, req, next))
}
