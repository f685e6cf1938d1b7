//! Liveness and readiness probes.
//!
//! `/health` is a constant-body liveness check. `/ready` reports
//! per-backend reachability: the circuit breaker's state is used as a
//! fast hint (Open means down without dialing; HalfOpen reports ok), and
//! Closed backends get a short TCP dial. The aggregate is memoized for
//! five seconds to bound probe load.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    config::RouteConfig,
    core::breaker::{CompositeBreaker, State},
};

const READINESS_CACHE_TTL: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pre-serialized liveness body.
const LIVENESS_BODY: &str = "{\"status\":\"ok\"}\n";

struct CachedReadiness {
    body: String,
    status: StatusCode,
    at: Instant,
}

pub struct HealthState {
    routes: Vec<RouteConfig>,
    breakers: HashMap<String, Arc<CompositeBreaker>>,
    cache: RwLock<Option<CachedReadiness>>,
}

impl HealthState {
    pub fn new(routes: &[RouteConfig], breakers: HashMap<String, Arc<CompositeBreaker>>) -> Self {
        Self {
            routes: routes.to_vec(),
            breakers,
            cache: RwLock::new(None),
        }
    }
}

pub async fn liveness() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(LIVENESS_BODY))
        .unwrap_or_else(|_| StatusCode::OK.into_response())
}

pub async fn readiness(state: Arc<HealthState>) -> Response {
    // Serve the cached aggregate while it is fresh.
    {
        let cache = state.cache.read().expect("readiness cache poisoned");
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() < READINESS_CACHE_TTL {
                return json_response(cached.status, cached.body.clone());
            }
        }
    }

    let checks = state.routes.iter().map(|route| {
        let breaker = state.breakers.get(&route.backend).cloned();
        async move {
            let status = probe_backend(route, breaker.as_deref()).await;
            (route.path_prefix.clone(), status)
        }
    });
    let results = futures_util::future::join_all(checks).await;

    let mut backends = serde_json::Map::new();
    let mut any_down = false;
    for (prefix, status) in results {
        if !status.ok {
            any_down = true;
        }
        backends.insert(prefix, json!(status.label));
    }

    let (http_status, status_str) = if any_down {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    } else {
        (StatusCode::OK, "ready")
    };

    let mut body = json!({"status": status_str, "backends": backends}).to_string();
    body.push('\n');

    {
        let mut cache = state.cache.write().expect("readiness cache poisoned");
        *cache = Some(CachedReadiness {
            body: body.clone(),
            status: http_status,
            at: Instant::now(),
        });
    }

    json_response(http_status, body)
}

struct ProbeStatus {
    label: &'static str,
    ok: bool,
}

async fn probe_backend(route: &RouteConfig, breaker: Option<&CompositeBreaker>) -> ProbeStatus {
    // Fast hint from the circuit breaker.
    if let Some(cb) = breaker {
        match cb.state() {
            State::Open => {
                return ProbeStatus {
                    label: "circuit-open",
                    ok: false,
                }
            }
            State::HalfOpen => {
                return ProbeStatus {
                    label: "circuit-half-open",
                    ok: true,
                }
            }
            State::Closed => {}
        }
    }

    let Some(addr) = dial_target(&route.backend) else {
        return ProbeStatus {
            label: "invalid URL",
            ok: false,
        };
    };

    match tokio::time::timeout(DIAL_TIMEOUT, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_conn)) => ProbeStatus {
            label: "ok",
            ok: true,
        },
        _ => {
            tracing::warn!(route = %route.path_prefix, backend = %route.backend, "backend unreachable");
            ProbeStatus {
                label: "unreachable",
                ok: false,
            }
        }
    }
}

/// host:port dial target for a backend URL, defaulting the port by scheme.
fn dial_target(backend: &str) -> Option<String> {
    let uri: Uri = backend.parse().ok()?;
    let host = uri.host()?;
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
    Some(format!("{host}:{port}"))
}

fn json_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}
