//! Pooled backend HTTP client.
//!
//! One hyper client per backend so each backend gets its own connection
//! pool with the route's pool settings. HTTPS backends are served by
//! rustls with the platform's native roots.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{header, http::HeaderValue, Request, Response, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::{
    config::{ConnectionPoolConfig, RouteConfig},
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

type PoolClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Production [`HttpClient`] holding one pooled client per backend URL.
pub struct PooledHttpClient {
    clients: HashMap<String, PoolClient>,
    /// Used for backends that appear after construction (admin probes,
    /// tests); default pool settings.
    fallback: PoolClient,
}

impl PooledHttpClient {
    /// Build clients for every unique backend in the route table.
    pub fn new(routes: &[RouteConfig]) -> Result<Self> {
        let connector = build_connector()?;

        let mut clients = HashMap::new();
        for route in routes {
            if clients.contains_key(&route.backend) {
                continue;
            }
            let pool = route.connection_pool.clone().unwrap_or_default();
            clients.insert(
                route.backend.clone(),
                build_client(connector.clone(), &pool),
            );
            tracing::info!(
                backend = %route.backend,
                max_idle_per_host = pool.max_idle_per_host,
                idle_timeout_ms = pool.idle_timeout_ms,
                "backend connection pool created"
            );
        }

        let fallback = build_client(connector, &ConnectionPoolConfig::default());
        Ok(Self { clients, fallback })
    }

    fn client_for(&self, backend: &str) -> &PoolClient {
        self.clients.get(backend).unwrap_or(&self.fallback)
    }
}

fn build_connector() -> Result<HttpsConnector<HttpConnector>> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.set_keepalive(Some(TCP_KEEPALIVE));

    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        if roots.add(cert).is_err() {
            tracing::warn!("failed to add native certificate to root store");
        }
    }
    if !native.errors.is_empty() {
        tracing::warn!(errors = ?native.errors, "some native certificates failed to load");
    }

    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http))
}

fn build_client(connector: HttpsConnector<HttpConnector>, pool: &ConnectionPoolConfig) -> PoolClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .pool_idle_timeout(pool.idle_timeout())
        .build(connector)
}

#[async_trait]
impl HttpClient for PooledHttpClient {
    async fn send_request(
        &self,
        backend: &str,
        mut req: Request<Body>,
    ) -> HttpClientResult<Response<Body>> {
        // The upstream connection is HTTP/1.1 regardless of what the
        // client spoke to us.
        *req.version_mut() = Version::HTTP_11;

        let host_header = {
            let uri = req.uri();
            let host = uri.host().ok_or_else(|| {
                HttpClientError::InvalidRequest(format!("upstream URI has no host: {uri}"))
            })?;
            let value = match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            HeaderValue::from_str(&value)
                .map_err(|e| HttpClientError::InvalidRequest(format!("invalid host header: {e}")))?
        };
        req.headers_mut().insert(header::HOST, host_header);

        let client = self.client_for(backend).clone();
        match client.request(req).await {
            Ok(response) => Ok(response.map(Body::new)),
            Err(e) => Err(HttpClientError::Connect(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(backend: &str, pool: Option<ConnectionPoolConfig>) -> RouteConfig {
        RouteConfig {
            path_prefix: "/api".to_string(),
            backend: backend.to_string(),
            connection_pool: pool,
            ..Default::default()
        }
    }

    #[test]
    fn builds_one_client_per_unique_backend() {
        let routes = vec![
            route("http://a:1", None),
            RouteConfig {
                path_prefix: "/other".to_string(),
                ..route("http://a:1", None)
            },
            route("http://b:2", None),
        ];
        let client = PooledHttpClient::new(&routes).unwrap();
        assert_eq!(client.clients.len(), 2);
    }

    #[test]
    fn per_route_pool_settings_are_honored() {
        let pool = ConnectionPoolConfig {
            max_idle_conns: 10,
            max_idle_per_host: 2,
            idle_timeout_ms: 1_000,
        };
        let client = PooledHttpClient::new(&[route("http://a:1", Some(pool))]).unwrap();
        assert!(client.clients.contains_key("http://a:1"));
    }

    #[tokio::test]
    async fn rejects_uri_without_host() {
        let client = PooledHttpClient::new(&[]).unwrap();
        let req = Request::builder()
            .uri("/relative/only")
            .body(Body::empty())
            .unwrap();
        let err = client.send_request("http://a:1", req).await.unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
    }
}
