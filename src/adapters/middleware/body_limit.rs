//! Request body size limiting.
//!
//! Requests with a declared `Content-Length` over the cap are rejected
//! immediately with 413. Chunked and streaming bodies are wrapped with a
//! byte-cap enforcer so the limit holds even without a declared length;
//! the consumer (the proxy's body buffering) surfaces the violation.

use std::{future::Future, pin::Pin};

use axum::{
    body::Body,
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::Limited;

use crate::{
    adapters::middleware::request_id::RequestId,
    error::{ApiError, ErrorCode},
};

async fn body_limit_middleware(max_bytes: u64, req: Request, next: Next) -> Response {
    let declared = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if let Some(len) = declared {
        if len > max_bytes {
            let err = ApiError::new(ErrorCode::BodyTooLarge);
            let err = match req.extensions().get::<RequestId>() {
                Some(id) => err.request_id(id.0.clone()),
                None => err,
            };
            return err.into_response();
        }
    }

    let (parts, body) = req.into_parts();
    let capped = Body::new(Limited::new(body, max_bytes as usize));
    next.run(Request::from_parts(parts, capped)).await
}

/// Cloneable closure wrapping [`body_limit_middleware`].
pub fn create_body_limit_middleware(
    max_bytes: u64,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| Box::pin(body_limit_middleware(max_bytes, req, next))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, StatusCode},
        middleware,
        routing::post,
        Router,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn app(max: u64) -> Router {
        Router::new()
            .route(
                "/",
                post(|req: Request| async move {
                    // Consume the capped body the way the proxy does.
                    match req.into_body().collect().await {
                        Ok(bytes) => format!("read {} bytes", bytes.to_bytes().len()).into_response(),
                        Err(_) => ApiError::new(ErrorCode::BodyTooLarge).into_response(),
                    }
                }),
            )
            .layer(middleware::from_fn(create_body_limit_middleware(max)))
    }

    #[tokio::test]
    async fn rejects_declared_oversize_immediately() {
        let resp = app(8)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header("Content-Length", "100")
                    .body(Body::from(vec![0u8; 100]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("GATEWAY_BODY_TOO_LARGE"));
    }

    #[tokio::test]
    async fn passes_small_bodies() {
        let resp = app(1024)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn caps_undeclared_streaming_bodies() {
        // A streaming body with no Content-Length: the limiter trips
        // when the consumer reads past the cap.
        let chunks: Vec<Result<_, std::io::Error>> =
            vec![Ok(vec![0u8; 64]), Ok(vec![0u8; 64])];
        let stream_body = Body::from_stream(futures_util::stream::iter(chunks));

        let resp = app(16)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .body(stream_body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
