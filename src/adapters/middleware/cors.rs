//! Cross-Origin Resource Sharing.
//!
//! CORS headers are only emitted when the request carries an `Origin`
//! header, so non-browser clients skip the overhead. Preflight `OPTIONS`
//! requests short-circuit with 204 and no body.

use std::{future::Future, pin::Pin, sync::Arc};

use axum::{
    extract::Request,
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};

#[derive(Debug, Clone)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age: String,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
                .map(String::from)
                .to_vec(),
            allowed_headers: ["Authorization", "Content-Type", "X-Request-ID"]
                .map(String::from)
                .to_vec(),
            max_age: "86400".to_string(),
        }
    }
}

/// Pre-joined header values, computed once.
struct CorsHeaders {
    origins: HeaderValue,
    methods: HeaderValue,
    headers: HeaderValue,
    max_age: HeaderValue,
}

impl CorsHeaders {
    fn new(settings: &CorsSettings) -> Self {
        let join = |list: &[String]| {
            HeaderValue::from_str(&list.join(", "))
                .unwrap_or_else(|_| HeaderValue::from_static("*"))
        };
        Self {
            origins: join(&settings.allowed_origins),
            methods: join(&settings.allowed_methods),
            headers: join(&settings.allowed_headers),
            max_age: HeaderValue::from_str(&settings.max_age)
                .unwrap_or_else(|_| HeaderValue::from_static("86400")),
        }
    }
}

async fn cors_middleware(pre: Arc<CorsHeaders>, req: Request, next: Next) -> Response {
    let has_origin = req.headers().contains_key("origin");
    let is_preflight = req.method() == Method::OPTIONS;

    let mut response = if is_preflight {
        let mut resp = Response::new(axum::body::Body::empty());
        *resp.status_mut() = StatusCode::NO_CONTENT;
        resp
    } else {
        next.run(req).await
    };

    if has_origin {
        let headers = response.headers_mut();
        headers.insert("Access-Control-Allow-Origin", pre.origins.clone());
        headers.insert("Access-Control-Allow-Methods", pre.methods.clone());
        headers.insert("Access-Control-Allow-Headers", pre.headers.clone());
        headers.insert("Access-Control-Max-Age", pre.max_age.clone());
    }

    response
}

/// Cloneable closure wrapping the CORS middleware.
pub fn create_cors_middleware(
    settings: CorsSettings,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    let pre = Arc::new(CorsHeaders::new(&settings));
    move |req, next| {
        let pre = Arc::clone(&pre);
        Box::pin(cors_middleware(pre, req, next))
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(create_cors_middleware(
                CorsSettings::default(),
            )))
    }

    #[tokio::test]
    async fn no_cors_headers_without_origin() {
        let resp = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(!resp.headers().contains_key("Access-Control-Allow-Origin"));
    }

    #[tokio::test]
    async fn emits_cors_headers_with_origin() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("Origin", "https://app.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let headers = resp.headers();
        assert_eq!(headers.get("Access-Control-Allow-Origin").unwrap(), "*");
        assert!(headers.contains_key("Access-Control-Allow-Methods"));
        assert_eq!(headers.get("Access-Control-Max-Age").unwrap(), "86400");
    }

    #[tokio::test]
    async fn preflight_is_204_with_empty_body() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/")
                    .header("Origin", "https://app.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers().contains_key("Access-Control-Allow-Origin"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
