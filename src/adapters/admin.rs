//! Read-only admin endpoints for runtime inspection.
//!
//! All endpoints are GET-only and guarded by a CIDR IP allowlist. They
//! bypass the middleware stack, so the guard is the only gate.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use ipnet::IpNet;
use serde_json::json;

use crate::{
    config::Reloader,
    core::{breaker::CompositeBreaker, rate_limit::RateLimiter, routing::RouteTable},
};

pub struct AdminState {
    reloader: Arc<Reloader>,
    limiter: Arc<RateLimiter>,
    breakers: HashMap<String, Arc<CompositeBreaker>>,
    table: RouteTable,
    allowlist: Vec<IpNet>,
}

impl AdminState {
    pub fn new(
        reloader: Arc<Reloader>,
        limiter: Arc<RateLimiter>,
        breakers: HashMap<String, Arc<CompositeBreaker>>,
        table: RouteTable,
        allowlist_cidrs: &[String],
    ) -> Self {
        // CIDRs are pre-validated by config validation.
        let allowlist = allowlist_cidrs
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect();
        Self {
            reloader,
            limiter,
            breakers,
            table,
            allowlist,
        }
    }

    fn is_allowed(&self, peer: std::net::IpAddr) -> bool {
        self.allowlist.iter().any(|net| net.contains(&peer))
    }
}

/// The `/admin` sub-router; nested by the gateway builder when admin is
/// enabled.
pub fn admin_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/routes", any(routes_handler))
        .route("/config", any(config_handler))
        .route("/limiters", any(limiters_handler))
        .with_state(state)
}

/// GET-only plus allowlist guard. Returns None when the request may
/// proceed.
fn guard(
    state: &AdminState,
    method: &Method,
    peer: Option<SocketAddr>,
) -> Option<Response> {
    if method != Method::GET {
        return Some(
            (
                StatusCode::METHOD_NOT_ALLOWED,
                Json(json!({"error": "Method Not Allowed"})),
            )
                .into_response(),
        );
    }

    let allowed = peer.map(|addr| state.is_allowed(addr.ip())).unwrap_or(false);
    if !allowed {
        if let Some(addr) = peer {
            tracing::warn!(client_ip = %addr.ip(), "admin access denied");
        }
        return Some(
            (StatusCode::FORBIDDEN, Json(json!({"error": "Forbidden"}))).into_response(),
        );
    }
    None
}

fn peer_of(req: &axum::extract::Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

async fn routes_handler(
    State(state): State<Arc<AdminState>>,
    req: axum::extract::Request,
) -> Response {
    if let Some(denied) = guard(&state, req.method(), peer_of(&req)) {
        return denied;
    }

    let routes: Vec<_> = state
        .table
        .routes()
        .iter()
        .map(|route| {
            let breaker_state = state
                .breakers
                .get(&route.backend)
                .map(|cb| cb.state().as_str())
                .unwrap_or("none");
            json!({
                "path_prefix": route.path_prefix,
                "backend": route.backend,
                "methods": route.methods,
                "auth_required": route.auth_required,
                "timeout_ms": route.timeout_ms,
                "retry_attempts": route.retry_attempts,
                "circuit_breaker_state": breaker_state,
            })
        })
        .collect();

    Json(json!({"routes": routes})).into_response()
}

async fn config_handler(
    State(state): State<Arc<AdminState>>,
    req: axum::extract::Request,
) -> Response {
    if let Some(denied) = guard(&state, req.method(), peer_of(&req)) {
        return denied;
    }

    let cfg = state.reloader.current();
    let mut value = serde_json::to_value(cfg.as_ref())
        .unwrap_or_else(|_| json!({"error": "config serialization failed"}));

    // Never expose the signing secret, even to operators.
    if let Some(secret) = value.pointer_mut("/auth/jwt_secret") {
        if secret.as_str().is_some_and(|s| !s.is_empty()) {
            *secret = json!("***");
        }
    }

    Json(value).into_response()
}

async fn limiters_handler(
    State(state): State<Arc<AdminState>>,
    req: axum::extract::Request,
) -> Response {
    if let Some(denied) = guard(&state, req.method(), peer_of(&req)) {
        return denied;
    }

    Json(json!({"rate_limiter": state.limiter.stats()})).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Config, RateLimitConfig, RouteConfig};

    fn state() -> Arc<AdminState> {
        let routes = vec![RouteConfig {
            path_prefix: "/api".to_string(),
            backend: "http://backend:1".to_string(),
            auth_required: true,
            ..Default::default()
        }];
        let mut cfg = Config {
            routes: routes.clone(),
            ..Default::default()
        };
        cfg.auth.jwt_secret = "super-secret".to_string();

        let reloader = Arc::new(Reloader::new("/tmp/unused.yaml", cfg));
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default(), &routes, &[]));
        let breakers = HashMap::new();
        Arc::new(AdminState::new(
            reloader,
            limiter,
            breakers,
            RouteTable::new(&routes),
            &["127.0.0.0/8".to_string()],
        ))
    }

    fn request(path: &str, method: Method, peer: [u8; 4]) -> axum::http::Request<Body> {
        let mut req = axum::http::Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 50000))));
        req
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn denies_ips_outside_allowlist() {
        let app = admin_router(state());
        let resp = app
            .oneshot(request("/routes", Method::GET, [203, 0, 113, 1]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn denies_non_get_methods() {
        let app = admin_router(state());
        let resp = app
            .oneshot(request("/routes", Method::POST, [127, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn routes_lists_breaker_state() {
        let app = admin_router(state());
        let resp = app
            .oneshot(request("/routes", Method::GET, [127, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["routes"][0]["path_prefix"], "/api");
        assert_eq!(json["routes"][0]["auth_required"], true);
        assert_eq!(json["routes"][0]["circuit_breaker_state"], "none");
    }

    #[tokio::test]
    async fn config_redacts_jwt_secret() {
        let app = admin_router(state());
        let resp = app
            .oneshot(request("/config", Method::GET, [127, 0, 0, 1]))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["auth"]["jwt_secret"], "***");
    }

    #[tokio::test]
    async fn limiters_reports_stats() {
        let app = admin_router(state());
        let resp = app
            .oneshot(request("/limiters", Method::GET, [127, 0, 0, 1]))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["rate_limiter"]["requests_per_second"], 100.0);
        assert_eq!(json["rate_limiter"]["active_clients"], 0);
    }
}
