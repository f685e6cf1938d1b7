//! Pipeline assembly.
//!
//! Builds the full request-processing stack from a config snapshot:
//!
//! ```text
//! Recovery → RequestID → Deadline → SecurityHeaders → Logging →
//! CORS → BodyLimit → RateLimit → Auth → Router → Backend
//! ```
//!
//! Health, readiness, metrics, and admin paths are registered on the
//! outer router and bypass the stack entirely.

use std::{collections::HashMap, sync::Arc};

use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    adapters::{
        admin::{admin_router, AdminState},
        health::{liveness, readiness, HealthState},
        middleware::{
            create_auth_middleware, create_body_limit_middleware, create_cors_middleware,
            create_deadline_middleware, create_logging_middleware, create_rate_limit_middleware,
            create_security_headers_middleware, recovery_middleware, request_id_middleware,
            BodyLogSettings, CorsSettings, LogLevelTable,
        },
        proxy::ProxyRouter,
    },
    config::{Config, Reloader},
    core::{
        auth::TokenValidator,
        breaker::{BreakerSettings, CompositeBreaker},
        rate_limit::RateLimiter,
        routing::RouteTable,
    },
    ports::http_client::HttpClient,
};

/// Everything the binary needs to serve and hot-reload.
pub struct GatewayParts {
    pub router: Router,
    pub limiter: Arc<RateLimiter>,
    pub breakers: HashMap<String, Arc<CompositeBreaker>>,
    pub log_levels: Arc<LogLevelTable>,
    pub table: RouteTable,
}

/// Build one circuit breaker per unique backend URL.
pub fn build_breakers(cfg: &Config) -> HashMap<String, Arc<CompositeBreaker>> {
    let settings = BreakerSettings::from(&cfg.circuit_breaker);
    let mut breakers: HashMap<String, Arc<CompositeBreaker>> = HashMap::new();
    for route in &cfg.routes {
        breakers.entry(route.backend.clone()).or_insert_with(|| {
            tracing::info!(backend = %route.backend, "circuit breaker created");
            Arc::new(CompositeBreaker::new(route.backend.clone(), &settings))
        });
    }
    breakers
}

/// Assemble the middleware stack and bypass routes.
pub fn build_gateway(
    cfg: &Config,
    client: Arc<dyn HttpClient>,
    metrics_handle: Option<PrometheusHandle>,
    reloader: Option<Arc<Reloader>>,
) -> GatewayParts {
    let table = RouteTable::new(&cfg.routes);
    let breakers = build_breakers(cfg);
    let limiter = Arc::new(RateLimiter::new(
        &cfg.rate_limit,
        &cfg.routes,
        &cfg.server.trusted_proxies,
    ));
    let log_levels = Arc::new(LogLevelTable::new(&cfg.routes));

    let proxy = Arc::new(ProxyRouter::new(
        table.clone(),
        breakers.clone(),
        Arc::clone(&client),
    ));

    // Innermost first; each .layer wraps everything added so far, so the
    // last layer is the outermost stage.
    let proxy_for_fallback = Arc::clone(&proxy);
    let mut pipeline = Router::new().fallback(move |req: axum::extract::Request| {
        let proxy = Arc::clone(&proxy_for_fallback);
        async move { proxy.serve(req).await }
    });

    if cfg.auth.enabled {
        let validator = Arc::new(TokenValidator::new(&cfg.auth));
        pipeline = pipeline.layer(middleware::from_fn(create_auth_middleware(
            validator,
            table.clone(),
        )));
    }

    pipeline = pipeline
        .layer(middleware::from_fn(create_rate_limit_middleware(
            Arc::clone(&limiter),
        )))
        .layer(middleware::from_fn(create_body_limit_middleware(
            cfg.server.max_body_bytes,
        )))
        .layer(middleware::from_fn(create_cors_middleware(
            CorsSettings::default(),
        )));

    let body_log = cfg.logging.body_logging.then(|| BodyLogSettings {
        max_bytes: cfg.logging.max_body_log_bytes,
    });
    pipeline = pipeline
        .layer(middleware::from_fn(create_logging_middleware(
            Arc::clone(&log_levels),
            body_log,
        )))
        .layer(middleware::from_fn(create_security_headers_middleware(
            cfg.server.tls.enabled,
        )));

    if let Some(timeout) = cfg.server.global_timeout() {
        pipeline = pipeline.layer(middleware::from_fn(create_deadline_middleware(timeout)));
    }

    pipeline = pipeline
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(recovery_middleware));

    // Bypass routes reach their handlers directly.
    let health_state = Arc::new(HealthState::new(&cfg.routes, breakers.clone()));
    let ready_state = Arc::clone(&health_state);
    let mut router = Router::new()
        .route("/health", get(liveness))
        .route(
            "/ready",
            get(move || {
                let state = Arc::clone(&ready_state);
                async move { readiness(state).await }
            }),
        );

    if cfg.metrics.is_enabled() {
        if let Some(handle) = metrics_handle {
            let path = cfg.metrics.path.clone();
            router = router.route(
                &path,
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
            tracing::info!(path = %cfg.metrics.path, "metrics endpoint registered");
        }
    }

    if cfg.admin.enabled {
        if let Some(reloader) = reloader {
            let admin_state = Arc::new(AdminState::new(
                reloader,
                Arc::clone(&limiter),
                breakers.clone(),
                table.clone(),
                &cfg.admin.ip_allowlist,
            ));
            router = router.nest("/admin", admin_router(admin_state));
            tracing::info!(allowlist = ?cfg.admin.ip_allowlist, "admin API enabled");
        }
    }

    let router = router.fallback_service(pipeline);

    GatewayParts {
        router,
        limiter,
        breakers,
        log_levels,
        table,
    }
}

/// Wire the hot-reload appliers: new snapshots re-point the rate
/// limiter, breaker parameters, and the log-level table.
pub fn register_reload_appliers(reloader: &Reloader, parts: &GatewayParts) {
    let limiter = Arc::clone(&parts.limiter);
    let breakers = parts.breakers.clone();
    let log_levels = Arc::clone(&parts.log_levels);

    reloader.on_reload(move |cfg| {
        limiter.update(&cfg.rate_limit, &cfg.routes);

        let settings = BreakerSettings::from(&cfg.circuit_breaker);
        for (backend, breaker) in &breakers {
            breaker.update_config(&settings);
            tracing::info!(backend = %backend, "circuit breaker config updated");
        }

        log_levels.update(&cfg.routes);
    });
}
