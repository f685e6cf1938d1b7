//! Rate-limit middleware glue over [`crate::core::rate_limit`].

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    adapters::middleware::request_id::RequestId,
    adapters::tls::ClientAddr,
    core::rate_limit::{Decision, RateLimiter},
    error::{ApiError, ErrorCode},
    metrics,
};

async fn rate_limit_middleware(limiter: Arc<RateLimiter>, req: Request, next: Next) -> Response {
    let Some(peer) = req
        .extensions()
        .get::<ConnectInfo<ClientAddr>>()
        .map(|info| info.0.ip())
    else {
        // No peer address (direct service calls in tests); nothing to key on.
        return next.run(req).await;
    };

    let xff = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());

    match limiter.allow(peer, xff, req.uri().path()) {
        Decision::Allow => next.run(req).await,
        Decision::Reject {
            retry_after_secs,
            route_label,
        } => {
            metrics::record_rate_limit_hit(&route_label);

            let err = ApiError::new(ErrorCode::RateLimitExceeded);
            let err = match req.extensions().get::<RequestId>() {
                Some(id) => err.request_id(id.0.clone()),
                None => err,
            };
            let mut response = err.into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
            response
        }
    }
}

/// Cloneable closure wrapping [`rate_limit_middleware`].
pub fn create_rate_limit_middleware(
    limiter: Arc<RateLimiter>,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| {
        let limiter = Arc::clone(&limiter);
        Box::pin(rate_limit_middleware(limiter, req, next))
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::RateLimitConfig;

    fn app(limiter: Arc<RateLimiter>) -> Router {
        Router::new()
            .route("/x", get(|| async { "ok" }))
            .layer(middleware::from_fn(create_rate_limit_middleware(limiter)))
    }

    fn with_peer(uri: &str) -> Request {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(ClientAddr(SocketAddr::from((
                [203, 0, 113, 1],
                9999,
            )))));
        req
    }

    #[tokio::test]
    async fn burst_sequence_is_200_200_429_with_retry_after() {
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig {
                requests_per_second: 1.0,
                burst_size: 2,
            },
            &[],
            &[],
        ));
        let app = app(limiter);

        let first = app.clone().oneshot(with_peer("/x")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(with_peer("/x")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);

        let third = app.clone().oneshot(with_peer("/x")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.headers().get("Retry-After").unwrap(), "1");
        let body = third.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("GATEWAY_RATE_LIMIT_EXCEEDED"));
    }

    #[tokio::test]
    async fn requests_without_peer_pass_through() {
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig {
                requests_per_second: 1.0,
                burst_size: 1,
            },
            &[],
            &[],
        ));
        let app = app(limiter);

        for _ in 0..5 {
            let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }
}
