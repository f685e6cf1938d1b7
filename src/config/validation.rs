//! Semantic validation of a parsed [`Config`].
//!
//! Validation runs after parsing and defaulting, both at startup and on
//! every hot reload; a snapshot that fails here is never published.

use std::collections::HashSet;

use ipnet::IpNet;

use crate::config::models::{Config, VALID_LOG_LEVELS};

/// A configuration rejection. The message names the offending field the
/// way the YAML spells it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("routes[{index}].{field}: {message}")]
    InvalidRoute {
        index: usize,
        field: String,
        message: String,
    },

    #[error("duplicate route path_prefix: {prefix}")]
    DuplicateRoute { prefix: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        message: message.into(),
    }
}

fn invalid_route(index: usize, field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidRoute {
        index,
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate the whole configuration, first failure wins.
pub fn validate(cfg: &Config) -> Result<(), ValidationError> {
    if cfg.server.port == 0 {
        return Err(invalid("server.port", "must be between 1 and 65535"));
    }

    if !cfg.metrics.path.starts_with('/') {
        return Err(invalid("metrics.path", "must start with /"));
    }

    if cfg.rate_limit.requests_per_second <= 0.0 {
        return Err(invalid("rate_limit.requests_per_second", "must be positive"));
    }
    if cfg.rate_limit.burst_size == 0 {
        return Err(invalid("rate_limit.burst_size", "must be positive"));
    }

    for (i, cidr) in cfg.server.trusted_proxies.iter().enumerate() {
        if cidr.parse::<IpNet>().is_err() {
            return Err(invalid(
                "server.trusted_proxies",
                format!("entry {i}: invalid CIDR {cidr:?}"),
            ));
        }
    }

    if cfg.auth.enabled {
        if cfg.auth.jwt_secret.is_empty() {
            return Err(invalid("auth.jwt_secret", "required when auth is enabled"));
        }
        if cfg.auth.issuer.is_empty() {
            return Err(invalid("auth.issuer", "required when auth is enabled"));
        }
        if cfg.auth.audience.is_empty() {
            return Err(invalid("auth.audience", "required when auth is enabled"));
        }
    }

    validate_circuit_breaker(cfg)?;

    if cfg.server.tls.enabled {
        if cfg.server.tls.cert_file.is_empty() {
            return Err(invalid("server.tls.cert_file", "required when TLS is enabled"));
        }
        if cfg.server.tls.key_file.is_empty() {
            return Err(invalid("server.tls.key_file", "required when TLS is enabled"));
        }
        if cfg.server.tls.min_version != "1.2" && cfg.server.tls.min_version != "1.3" {
            return Err(invalid(
                "server.tls.min_version",
                format!("must be \"1.2\" or \"1.3\", got {:?}", cfg.server.tls.min_version),
            ));
        }
    }

    if cfg.logging.body_logging && cfg.logging.max_body_log_bytes == 0 {
        return Err(invalid(
            "logging.max_body_log_bytes",
            "must be positive when body_logging is enabled",
        ));
    }

    if cfg.admin.enabled {
        if cfg.admin.ip_allowlist.is_empty() {
            return Err(invalid("admin.ip_allowlist", "required when admin is enabled"));
        }
        for (i, cidr) in cfg.admin.ip_allowlist.iter().enumerate() {
            if cidr.parse::<IpNet>().is_err() {
                return Err(invalid(
                    "admin.ip_allowlist",
                    format!("entry {i}: invalid CIDR {cidr:?}"),
                ));
            }
        }
    }

    validate_routes(cfg)
}

fn validate_circuit_breaker(cfg: &Config) -> Result<(), ValidationError> {
    let cb = &cfg.circuit_breaker;
    if cb.window_size == 0 {
        return Err(invalid("circuit_breaker.window_size", "must be positive"));
    }
    if cb.failure_threshold <= 0.0 || cb.failure_threshold > 1.0 {
        return Err(invalid(
            "circuit_breaker.failure_threshold",
            "must be between 0 (exclusive) and 1 (inclusive)",
        ));
    }
    if cb.reset_timeout_ms == 0 {
        return Err(invalid("circuit_breaker.reset_timeout_ms", "must be positive"));
    }
    if cb.half_open_max == 0 {
        return Err(invalid("circuit_breaker.half_open_max", "must be positive"));
    }
    if cb.adaptive {
        if cb.min_threshold <= 0.0 || cb.min_threshold >= cb.failure_threshold {
            return Err(invalid(
                "circuit_breaker.min_threshold",
                "must be between 0 and failure_threshold",
            ));
        }
        if cb.latency_ceiling_ms == 0 {
            return Err(invalid(
                "circuit_breaker.latency_ceiling_ms",
                "must be positive when adaptive is enabled",
            ));
        }
    }
    Ok(())
}

fn validate_routes(cfg: &Config) -> Result<(), ValidationError> {
    if cfg.routes.is_empty() {
        return Err(invalid("routes", "at least one route must be configured"));
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(cfg.routes.len());
    for (i, route) in cfg.routes.iter().enumerate() {
        if route.path_prefix.is_empty() {
            return Err(invalid_route(i, "path_prefix", "is required"));
        }
        if !route.path_prefix.starts_with('/') {
            return Err(invalid_route(i, "path_prefix", "must start with /"));
        }
        if route.backend.is_empty() {
            return Err(invalid_route(i, "backend", "is required"));
        }
        validate_backend_url(i, &route.backend)?;

        if !seen.insert(route.path_prefix.as_str()) {
            return Err(ValidationError::DuplicateRoute {
                prefix: route.path_prefix.clone(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&route.log_level.as_str()) {
            return Err(invalid_route(
                i,
                "log_level",
                format!(
                    "must be one of debug, info, warn, error, none; got {:?}",
                    route.log_level
                ),
            ));
        }

        if route.fallback_status != 0 && !(200..=599).contains(&route.fallback_status) {
            return Err(invalid_route(
                i,
                "fallback_status",
                "must be between 200 and 599",
            ));
        }

        if let Some(rate) = &route.rate_override {
            if rate.requests_per_second <= 0.0 {
                return Err(invalid_route(
                    i,
                    "rate_override.requests_per_second",
                    "must be positive",
                ));
            }
            if rate.burst_size == 0 {
                return Err(invalid_route(i, "rate_override.burst_size", "must be positive"));
            }
        }
    }
    Ok(())
}

/// Backend URLs must be absolute http/https with a non-empty host. The
/// check is done with `http::Uri` so it agrees with what the proxy will
/// later accept.
fn validate_backend_url(index: usize, backend: &str) -> Result<(), ValidationError> {
    let uri: http::Uri = backend
        .parse()
        .map_err(|e| invalid_route(index, "backend", format!("invalid URL: {e}")))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        other => {
            return Err(invalid_route(
                index,
                "backend",
                format!("scheme must be http or https, got {other:?}"),
            ))
        }
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid_route(index, "backend", "host is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{RateLimitConfig, RouteConfig};

    fn valid_config() -> Config {
        Config {
            routes: vec![RouteConfig {
                path_prefix: "/api".to_string(),
                backend: "http://localhost:3000".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn rejects_empty_routes() {
        let cfg = Config::default();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_relative_prefix() {
        let mut cfg = valid_config();
        cfg.routes[0].path_prefix = "api".to_string();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("path_prefix"));
    }

    #[test]
    fn rejects_bad_backend_scheme() {
        let mut cfg = valid_config();
        cfg.routes[0].backend = "ftp://host:21".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_prefixes() {
        let mut cfg = valid_config();
        cfg.routes.push(cfg.routes[0].clone());
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateRoute { .. }));
    }

    #[test]
    fn rejects_auth_without_secret() {
        let mut cfg = valid_config();
        cfg.auth.enabled = true;
        cfg.auth.issuer = "iss".to_string();
        cfg.auth.audience = "aud".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_threshold() {
        let mut cfg = valid_config();
        cfg.circuit_breaker.failure_threshold = 1.5;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_adaptive_without_sane_min_threshold() {
        let mut cfg = valid_config();
        cfg.circuit_breaker.adaptive = true;
        cfg.circuit_breaker.latency_ceiling_ms = 2_000;
        cfg.circuit_breaker.min_threshold = 0.9; // above failure_threshold
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut cfg = valid_config();
        cfg.routes[0].log_level = "verbose".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_trusted_proxy_cidr() {
        let mut cfg = valid_config();
        cfg.server.trusted_proxies = vec!["10.0.0.0/40".to_string()];
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_admin_without_allowlist() {
        let mut cfg = valid_config();
        cfg.admin.enabled = true;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_rate_override() {
        let mut cfg = valid_config();
        cfg.routes[0].rate_override = Some(RateLimitConfig {
            requests_per_second: 0.0,
            burst_size: 5,
        });
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_tls_without_files() {
        let mut cfg = valid_config();
        cfg.server.tls.enabled = true;
        cfg.server.tls.min_version = "1.2".to_string();
        assert!(validate(&cfg).is_err());
    }
}
