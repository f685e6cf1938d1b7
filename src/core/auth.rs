//! JWT Bearer token validation.
//!
//! HMAC-SHA256 only; any other algorithm is rejected outright. Issuer,
//! audience, and a fresh `exp` are mandatory. Scopes come from the
//! OAuth2-style space-separated `scope` claim and must be a superset of
//! the configured required scopes.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::AuthConfig;

/// Validated claims injected into the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub issuer: String,
    pub audience: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("missing required scope: {missing}")]
    InsufficientScope { missing: String },
}

/// The `aud` claim may be a single string or an array; the first entry
/// wins in the array case.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn into_first(self) -> String {
        match self {
            Audience::One(aud) => aud,
            Audience::Many(list) => list.into_iter().next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    scope: Option<String>,
}

/// Extract the Bearer token from the Authorization header. The scheme is
/// case-insensitive and separated by a single run of whitespace.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Reusable validator built once from config.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    required_scopes: Vec<String>,
}

impl TokenValidator {
    pub fn new(cfg: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[cfg.issuer.as_str()]);
        validation.set_audience(&[cfg.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_exp = true;

        Self {
            key: DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
            validation,
            required_scopes: cfg.scopes.clone(),
        }
    }

    /// Validate a token and return its claims, or the precise failure.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<RawClaims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let raw = data.claims;
        let scopes: Vec<String> = raw
            .scope
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        for required in &self.required_scopes {
            if !scopes.iter().any(|s| s == required) {
                return Err(AuthError::InsufficientScope {
                    missing: required.clone(),
                });
            }
        }

        Ok(Claims {
            subject: raw.sub.unwrap_or_default(),
            issuer: raw.iss.unwrap_or_default(),
            audience: raw.aud.map(Audience::into_first).unwrap_or_default(),
            scopes,
        })
    }
}
