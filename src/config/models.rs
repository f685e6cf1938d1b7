//! Configuration data structures.
//!
//! These types map directly to the YAML configuration file. They are
//! serde-friendly with per-field defaults so minimal configs stay concise.
//! A loaded [`Config`] is immutable once built; the reloader publishes
//! whole snapshots behind an atomic pointer, so nothing here needs
//! interior mutability.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub admin: AdminConfig,
    pub routes: Vec<RouteConfig>,

    /// Non-fatal issues detected during loading. Carried on the snapshot
    /// itself so concurrent reloads never share mutable state.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// CIDRs whose `X-Forwarded-For` headers are trusted. Empty (the
    /// default) means XFF is ignored entirely.
    pub trusted_proxies: Vec<String>,
    pub max_body_bytes: u64,
    /// Global request deadline; 0 disables.
    pub global_timeout_ms: u64,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout_secs: 15,
            write_timeout_secs: 15,
            shutdown_timeout_secs: 10,
            trusted_proxies: Vec::new(),
            max_body_bytes: 1_048_576,
            global_timeout_ms: 0,
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// The global request deadline, `None` when disabled.
    pub fn global_timeout(&self) -> Option<Duration> {
        if self.global_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.global_timeout_ms))
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// TLS termination settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    /// Minimum protocol version, "1.2" or "1.3".
    pub min_version: String,
}

/// Prometheus metrics endpoint settings. Enabled defaults to true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: Option<bool>,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            path: "/metrics".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Access-log output selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
}

/// Access log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "stdout" or "stderr". Anything else falls back to stdout with a
    /// config warning.
    pub output: String,
    /// Opt-in request/response body logging.
    pub body_logging: bool,
    /// Cap on captured body bytes per direction.
    pub max_body_log_bytes: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output: "stdout".to_string(),
            body_logging: false,
            max_body_log_bytes: 4096,
        }
    }
}

impl LoggingConfig {
    pub fn output_kind(&self) -> LogOutput {
        match self.output.as_str() {
            "stderr" => LogOutput::Stderr,
            _ => LogOutput::Stdout,
        }
    }
}

/// Admin API settings. Disabled by default; when enabled an IP allowlist
/// is mandatory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// CIDR notation.
    pub ip_allowlist: Vec<String>,
}

/// Global (or per-route override) rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100.0,
            burst_size: 50,
        }
    }
}

/// JWT Bearer authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    /// Scopes every token must carry (space-separated `scope` claim).
    pub scopes: Vec<String>,
}

/// Circuit breaker settings applied to every backend.
///
/// The failure-rate breaker is always active. The timeout, bulkhead, and
/// adaptive layers activate when their settings are non-zero/true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub reset_timeout_ms: u64,
    pub half_open_max: u32,
    /// Successes slower than this count as failures; 0 disables.
    pub slow_threshold_ms: u64,
    /// Bulkhead concurrency cap; 0 disables.
    pub max_concurrent: usize,
    pub adaptive: bool,
    pub latency_ceiling_ms: u64,
    pub min_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            reset_timeout_ms: 30_000,
            half_open_max: 2,
            slow_threshold_ms: 0,
            max_concurrent: 0,
            adaptive: false,
            latency_ceiling_ms: 0,
            min_threshold: 0.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn slow_threshold(&self) -> Option<Duration> {
        if self.slow_threshold_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.slow_threshold_ms))
        }
    }

    pub fn latency_ceiling(&self) -> Duration {
        Duration::from_millis(self.latency_ceiling_ms)
    }
}

/// Per-backend HTTP connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Accepted for schema compatibility; the transport enforces only a
    /// per-host idle cap, not a process-wide total.
    pub max_idle_conns: usize,
    pub max_idle_per_host: usize,
    pub idle_timeout_ms: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_per_host: 10,
            idle_timeout_ms: 90_000,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// A single proxy route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Absolute path prefix, e.g. "/api/users".
    pub path_prefix: String,
    /// Absolute backend URL with http/https scheme and a host.
    pub backend: String,
    pub strip_prefix: bool,
    /// Allowed HTTP methods; empty means all.
    pub methods: Vec<String>,
    pub auth_required: bool,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Extra attempts after the first; total attempts = retry_attempts + 1.
    pub retry_attempts: u32,
    /// Headers injected into the upstream request.
    pub headers: HashMap<String, String>,
    pub rate_override: Option<RateLimitConfig>,
    pub connection_pool: Option<ConnectionPoolConfig>,
    /// Served instead of 503 when the circuit is open; 0 disables.
    pub fallback_status: u16,
    pub fallback_body: String,
    /// "debug", "info", "warn", "error", or "none"; empty means "info".
    pub log_level: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path_prefix: String::new(),
            backend: String::new(),
            strip_prefix: false,
            methods: Vec::new(),
            auth_required: false,
            timeout_ms: 30_000,
            retry_attempts: 0,
            headers: HashMap::new(),
            rate_override: None,
            connection_pool: None,
            fallback_status: 0,
            fallback_body: String::new(),
            log_level: String::new(),
        }
    }
}

impl RouteConfig {
    /// Per-attempt timeout; defaults to 30 s when unset.
    pub fn timeout(&self) -> Duration {
        if self.timeout_ms == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }

    /// Total proxy attempts (retries + the initial attempt), always >= 1.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback_status != 0
    }
}

/// Accepted route `log_level` strings; empty means the default ("info").
pub const VALID_LOG_LEVELS: &[&str] = &["", "debug", "info", "warn", "error", "none"];
