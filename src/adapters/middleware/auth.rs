//! Authentication middleware glue over [`crate::core::auth`].
//!
//! Applies only when auth is globally enabled and the matched route asks
//! for it; everything else passes through untouched.

use std::{future::Future, pin::Pin, sync::Arc};

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    adapters::middleware::request_id::RequestId,
    core::{
        auth::{extract_bearer_token, AuthError, TokenValidator},
        routing::RouteTable,
    },
    error::{ApiError, ErrorCode},
    metrics,
};

async fn auth_middleware(
    validator: Arc<TokenValidator>,
    table: RouteTable,
    mut req: Request,
    next: Next,
) -> Response {
    if !table.requires_auth(req.uri().path()) {
        return next.run(req).await;
    }

    let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());

    let Some(token) = extract_bearer_token(req.headers()) else {
        metrics::record_auth_failure("missing_token");
        return reject(ApiError::new(ErrorCode::AuthMissingToken), request_id);
    };

    match validator.validate(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(AuthError::InsufficientScope { missing }) => {
            metrics::record_auth_failure("insufficient_scope");
            tracing::warn!(path = %req.uri().path(), missing = %missing, "auth failure");
            reject(
                ApiError::with_message(
                    ErrorCode::AuthInsufficientScope,
                    format!("missing required scope: {missing}"),
                ),
                request_id,
            )
        }
        Err(AuthError::InvalidToken(reason)) => {
            metrics::record_auth_failure("invalid_token");
            tracing::warn!(path = %req.uri().path(), error = %reason, "auth failure");
            reject(ApiError::new(ErrorCode::AuthInvalidToken), request_id)
        }
    }
}

fn reject(err: ApiError, request_id: Option<String>) -> Response {
    match request_id {
        Some(id) => err.request_id(id),
        None => err,
    }
    .into_response()
}

/// Cloneable closure wrapping [`auth_middleware`]. Built only when auth
/// is enabled in config; otherwise the layer is omitted entirely.
pub fn create_auth_middleware(
    validator: Arc<TokenValidator>,
    table: RouteTable,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| {
        let validator = Arc::clone(&validator);
        let table = table.clone();
        Box::pin(auth_middleware(validator, table, req, next))
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{AuthConfig, RouteConfig};

    const SECRET: &str = "mw-secret";

    fn auth_cfg(scopes: &[&str]) -> AuthConfig {
        AuthConfig {
            enabled: true,
            jwt_secret: SECRET.to_string(),
            issuer: "iss".to_string(),
            audience: "aud".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn token(scope: &str) -> String {
        let exp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 600;
        encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub":"u","iss":"iss","aud":"aud","exp":exp,"scope":scope}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn app(scopes: &[&str]) -> Router {
        let table = RouteTable::new(&[
            RouteConfig {
                path_prefix: "/protected".to_string(),
                backend: "http://b".to_string(),
                auth_required: true,
                ..Default::default()
            },
            RouteConfig {
                path_prefix: "/open".to_string(),
                backend: "http://b".to_string(),
                ..Default::default()
            },
        ]);
        let validator = Arc::new(TokenValidator::new(&auth_cfg(scopes)));
        Router::new()
            .route("/protected", get(|| async { "secret" }))
            .route("/open", get(|| async { "public" }))
            .layer(middleware::from_fn(create_auth_middleware(validator, table)))
    }

    #[tokio::test]
    async fn open_route_needs_no_token() {
        let resp = app(&[])
            .oneshot(Request::builder().uri("/open").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let resp = app(&[])
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("GATEWAY_AUTH_MISSING_TOKEN"));
    }

    #[tokio::test]
    async fn garbage_token_is_401_invalid() {
        let resp = app(&[])
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", "Bearer not.a.jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("GATEWAY_AUTH_INVALID_TOKEN"));
    }

    #[tokio::test]
    async fn insufficient_scope_is_403() {
        let resp = app(&["read", "write"])
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token("read")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body)
            .unwrap()
            .contains("GATEWAY_AUTH_INSUFFICIENT_SCOPE"));
    }

    #[tokio::test]
    async fn valid_token_passes() {
        let resp = app(&["read"])
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token("read write")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
