//! Configuration loading.
//!
//! Reads the YAML file, substitutes `${VAR}` references from the process
//! environment, parses via the `config` crate, applies conditional
//! defaults, validates, and attaches non-fatal warnings to the snapshot.

use std::path::Path;

use config::{File, FileFormat};
use eyre::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{models::Config, validation::validate};

static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var regex"));

/// Replace `${VAR_NAME}` patterns with the corresponding environment
/// variable value. Unresolved references are left in place so validation
/// and warning collection can see them.
fn expand_env_vars(raw: &str) -> String {
    ENV_VAR_RE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            std::env::var(key).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Load, substitute, parse, default, and validate a config file.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    load_from_str(&raw).with_context(|| format!("loading config from {}", path.display()))
}

/// Parse configuration from raw YAML text. Used by [`load`] and by tests.
pub fn load_from_str(raw: &str) -> Result<Config> {
    let expanded = expand_env_vars(raw);

    let settings = config::Config::builder()
        .add_source(File::from_str(&expanded, FileFormat::Yaml))
        .build()
        .context("parsing config")?;

    let mut cfg: Config = settings.try_deserialize().context("deserializing config")?;

    apply_defaults(&mut cfg);
    validate(&cfg).context("validating config")?;
    cfg.warnings = collect_warnings(&cfg);

    Ok(cfg)
}

/// Defaults that depend on other fields and so cannot be expressed as
/// serde field defaults.
fn apply_defaults(cfg: &mut Config) {
    if cfg.server.tls.enabled && cfg.server.tls.min_version.is_empty() {
        cfg.server.tls.min_version = "1.2".to_string();
    }

    let cb = &mut cfg.circuit_breaker;
    if cb.adaptive && cb.latency_ceiling_ms == 0 {
        cb.latency_ceiling_ms = 2_000;
    }
    if cb.adaptive && cb.min_threshold == 0.0 {
        cb.min_threshold = 0.2;
    }

    for route in &mut cfg.routes {
        if route.timeout_ms == 0 {
            route.timeout_ms = 30_000;
        }
    }
}

fn collect_warnings(cfg: &Config) -> Vec<String> {
    let mut warnings = Vec::new();
    if cfg.auth.enabled && cfg.auth.jwt_secret.contains("${") {
        warnings.push("auth.jwt_secret contains unresolved environment variable".to_string());
    }
    if !matches!(cfg.logging.output.as_str(), "stdout" | "stderr") {
        warnings.push(format!(
            "logging.output {:?} is not supported, falling back to stdout",
            cfg.logging.output
        ));
    }
    warnings
}
