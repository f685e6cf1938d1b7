//! The reverse-proxy engine.
//!
//! Matches a route, validates the method, consults the backend's circuit
//! breaker, and drives the retry loop. Non-final attempts buffer the full
//! upstream response so a non-retryable answer can be replayed to the
//! client without contacting the backend again; a request that ultimately
//! succeeds hits the backend exactly once. The final attempt streams the
//! upstream body straight through.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::{Body, Bytes},
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::middleware::request_id::RequestId,
    adapters::tls::ClientAddr,
    config::RouteConfig,
    core::{breaker::CompositeBreaker, routing::RouteTable},
    error::{ApiError, ErrorCode},
    metrics,
    ports::http_client::HttpClient,
};

const GATEWAY_LATENCY: HeaderName = HeaderName::from_static("x-gateway-latency");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Retryable upstream statuses: 502, 503, 504 from a non-final attempt.
fn is_retryable(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

/// Exponential backoff between attempts: 100 ms · 2^(attempt-1).
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100u64 << (attempt - 1).min(16))
}

/// Releases the bulkhead slot exactly once, on every exit path.
struct ReleaseGuard(Arc<CompositeBreaker>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A fully buffered upstream response from a non-final attempt.
struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

enum AttemptOutcome {
    Response(BufferedResponse),
    /// Transport error or per-attempt timeout; synthesized as 502.
    Failed,
}

pub struct ProxyRouter {
    table: RouteTable,
    /// Pre-built uppercase method sets for routes that restrict methods.
    methods: HashMap<String, HashSet<String>>,
    breakers: HashMap<String, Arc<CompositeBreaker>>,
    client: Arc<dyn HttpClient>,
}

impl ProxyRouter {
    pub fn new(
        table: RouteTable,
        breakers: HashMap<String, Arc<CompositeBreaker>>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        let methods = table
            .routes()
            .iter()
            .filter(|r| !r.methods.is_empty())
            .map(|r| {
                let set = r.methods.iter().map(|m| m.to_uppercase()).collect();
                (r.path_prefix.clone(), set)
            })
            .collect();

        Self {
            table,
            methods,
            breakers,
            client,
        }
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.table
    }

    /// Handle one request end to end.
    pub async fn serve(&self, req: axum::extract::Request) -> Response {
        let start = Instant::now();
        let path = req.uri().path().to_string();
        let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());
        let cancel = req
            .extensions()
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default();
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<ClientAddr>>()
            .map(|info| info.0.ip());

        let Some(route) = self.table.match_route(&path).cloned() else {
            return attach_id(ApiError::new(ErrorCode::RouteNotFound), &request_id);
        };

        if let Some(allowed) = self.methods.get(&route.path_prefix) {
            if !allowed.contains(req.method().as_str()) {
                let err = ApiError::with_message(
                    ErrorCode::MethodNotAllowed,
                    format!("method {} not allowed for {}", req.method(), route.path_prefix),
                );
                return attach_id(err, &request_id);
            }
        }

        let _active = metrics::ActiveConnectionGuard::acquire();

        let breaker = self.breakers.get(&route.backend).cloned();
        let _release = match &breaker {
            Some(cb) => {
                if !cb.allow() {
                    return open_circuit_response(&route, &request_id);
                }
                Some(ReleaseGuard(Arc::clone(cb)))
            }
            None => None,
        };

        let (parts, body) = req.into_parts();

        // The inbound body is buffered once (already capped by the body
        // limit middleware) so every attempt sends identical bytes.
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, path = %path, "failed reading request body");
                return attach_id(ApiError::new(ErrorCode::BodyTooLarge), &request_id);
            }
        };

        let headers = upstream_headers(parts.headers, &route, peer_ip);
        let upstream_uri = match build_upstream_uri(&route, &path, parts.uri.query()) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(backend = %route.backend, error = %e, "invalid upstream URI");
                let resp = attach_id(ApiError::new(ErrorCode::UpstreamUnavailable), &request_id);
                return self.finish(resp, &route, &parts.method, start);
            }
        };
        let method = parts.method.clone();

        // Non-final attempts: buffer, replay or retry.
        let max_attempts = route.max_attempts();
        for attempt in 1..max_attempts {
            if cancel.is_cancelled() {
                return self.cancelled(&route, &method, &request_id, start);
            }

            let attempt_start = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled(&route, &method, &request_id, start);
                }
                outcome = self.buffered_attempt(&route, &method, &upstream_uri, &headers, &body_bytes) => outcome,
            };
            let latency = attempt_start.elapsed();

            match outcome {
                AttemptOutcome::Response(buffered) => {
                    let status = buffered.status.as_u16();
                    if !is_retryable(status) {
                        if let Some(cb) = &breaker {
                            cb.record_success(latency);
                        }
                        let resp = replay(buffered, start);
                        return self.finish(resp, &route, &method, start);
                    }
                    if let Some(cb) = &breaker {
                        cb.record_failure(latency);
                    }
                    metrics::record_retry(&route.path_prefix, &route.backend);
                    tracing::warn!(
                        path = %path,
                        backend = %route.backend,
                        attempt,
                        status,
                        "retrying request"
                    );
                }
                AttemptOutcome::Failed => {
                    if let Some(cb) = &breaker {
                        cb.record_failure(latency);
                    }
                    metrics::record_retry(&route.path_prefix, &route.backend);
                    tracing::warn!(
                        path = %path,
                        backend = %route.backend,
                        attempt,
                        "retrying request after transport failure"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled(&route, &method, &request_id, start);
                }
                _ = tokio::time::sleep(backoff_delay(attempt)) => {}
            }
        }

        // Final attempt: stream straight through to the client.
        if cancel.is_cancelled() {
            return self.cancelled(&route, &method, &request_id, start);
        }

        let attempt_start = Instant::now();
        let upstream_req = build_request(&method, &upstream_uri, &headers, &body_bytes);
        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                return self.cancelled(&route, &method, &request_id, start);
            }
            sent = tokio::time::timeout(
                route.timeout(),
                self.client.send_request(&route.backend, upstream_req),
            ) => sent,
        };
        let latency = attempt_start.elapsed();

        match sent {
            Ok(Ok(mut resp)) => {
                let status = resp.status().as_u16();
                if let Some(cb) = &breaker {
                    if status >= 500 {
                        cb.record_failure(latency);
                    } else {
                        cb.record_success(latency);
                    }
                }
                set_latency_header(resp.headers_mut(), start);
                self.finish(resp, &route, &method, start)
            }
            Ok(Err(e)) => {
                tracing::error!(backend = %route.backend, error = %e, "backend request failed");
                if let Some(cb) = &breaker {
                    cb.record_failure(latency);
                }
                let resp = attach_id(ApiError::new(ErrorCode::UpstreamUnavailable), &request_id);
                self.finish(resp, &route, &method, start)
            }
            Err(_elapsed) => {
                tracing::error!(
                    backend = %route.backend,
                    timeout_ms = route.timeout().as_millis() as u64,
                    "backend request timed out"
                );
                if let Some(cb) = &breaker {
                    cb.record_failure(latency);
                }
                let resp = attach_id(ApiError::new(ErrorCode::UpstreamUnavailable), &request_id);
                self.finish(resp, &route, &method, start)
            }
        }
    }

    /// Send one attempt and buffer the whole response, all under the
    /// route's per-attempt timeout.
    async fn buffered_attempt(
        &self,
        route: &RouteConfig,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> AttemptOutcome {
        let req = build_request(method, uri, headers, body);
        let attempt = async {
            let resp = self
                .client
                .send_request(&route.backend, req)
                .await
                .map_err(|e| e.to_string())?;
            let (parts, body) = resp.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| e.to_string())?
                .to_bytes();
            Ok::<_, String>(BufferedResponse {
                status: parts.status,
                headers: parts.headers,
                body: bytes,
            })
        };

        match tokio::time::timeout(route.timeout(), attempt).await {
            Ok(Ok(buffered)) => AttemptOutcome::Response(buffered),
            Ok(Err(e)) => {
                tracing::error!(backend = %route.backend, error = %e, "backend attempt failed");
                AttemptOutcome::Failed
            }
            Err(_elapsed) => AttemptOutcome::Failed,
        }
    }

    fn cancelled(
        &self,
        route: &RouteConfig,
        method: &Method,
        request_id: &Option<String>,
        start: Instant,
    ) -> Response {
        let resp = attach_id(ApiError::new(ErrorCode::RequestCancelled), request_id);
        self.finish(resp, route, method, start)
    }

    /// Record the completion metrics and hand the response back.
    fn finish(
        &self,
        resp: Response,
        route: &RouteConfig,
        method: &Method,
        start: Instant,
    ) -> Response {
        let status = resp.status().as_u16();
        metrics::record_request(&route.path_prefix, method.as_str(), status, start.elapsed());
        if status >= 500 {
            metrics::record_backend_error(&route.path_prefix, &route.backend, status);
        }
        resp
    }
}

fn attach_id(err: ApiError, request_id: &Option<String>) -> Response {
    match request_id {
        Some(id) => err.request_id(id.clone()).into_response(),
        None => err.into_response(),
    }
}

fn open_circuit_response(route: &RouteConfig, request_id: &Option<String>) -> Response {
    if route.has_fallback() {
        let status =
            StatusCode::from_u16(route.fallback_status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return Response::builder()
            .status(status)
            .body(Body::from(route.fallback_body.clone()))
            .unwrap_or_else(|_| StatusCode::SERVICE_UNAVAILABLE.into_response());
    }
    attach_id(ApiError::new(ErrorCode::CircuitOpen), request_id)
}

/// Headers for the upstream request: the inbound headers, the route's
/// configured overlay, and `X-Forwarded-For` with the peer appended.
/// `X-Request-ID` is already present on the inbound headers.
fn upstream_headers(
    mut headers: HeaderMap,
    route: &RouteConfig,
    peer_ip: Option<std::net::IpAddr>,
) -> HeaderMap {
    headers.remove(header::CONNECTION);
    headers.remove(header::TRANSFER_ENCODING);

    for (name, value) in &route.headers {
        match (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "invalid route header, skipping"),
        }
    }

    if let Some(ip) = peer_ip {
        let appended = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&appended) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }

    headers
}

fn build_upstream_uri(
    route: &RouteConfig,
    path: &str,
    query: Option<&str>,
) -> Result<Uri, http::uri::InvalidUri> {
    let mut upstream_path = if route.strip_prefix {
        let stripped = &path[route.path_prefix.len().min(path.len())..];
        if stripped.is_empty() {
            "/".to_string()
        } else {
            stripped.to_string()
        }
    } else {
        path.to_string()
    };

    if let Some(query) = query {
        upstream_path.push('?');
        upstream_path.push_str(query);
    }

    format!("{}{}", route.backend.trim_end_matches('/'), upstream_path).parse()
}

fn build_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> hyper::Request<Body> {
    let mut req = hyper::Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .body(Body::from(body.clone()))
        .expect("upstream request parts are pre-validated");
    *req.headers_mut() = headers.clone();
    req
}

/// Copy a buffered upstream response to the client, stamping the gateway
/// latency header first.
fn replay(buffered: BufferedResponse, start: Instant) -> Response {
    let mut resp = Response::new(Body::from(buffered.body));
    *resp.status_mut() = buffered.status;
    *resp.headers_mut() = buffered.headers;
    resp.headers_mut().remove(header::TRANSFER_ENCODING);
    set_latency_header(resp.headers_mut(), start);
    resp
}

fn set_latency_header(headers: &mut HeaderMap, start: Instant) {
    if let Ok(value) = HeaderValue::from_str(&format!("{:?}", start.elapsed())) {
        headers.insert(GATEWAY_LATENCY.clone(), value);
    }
}
