//! Structured gateway error responses.
//!
//! Every error the gateway itself produces goes through [`ApiError`] so
//! clients always receive the same JSON body shape with a stable,
//! machine-readable `error_code`. The codes form a public contract —
//! clients program against them, so existing codes must never be renamed
//! or removed.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use serde::Serialize;

/// Machine-readable error classification.
///
/// Stable contract: each variant maps to exactly one wire code and one
/// HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    RouteNotFound,
    MethodNotAllowed,
    UpstreamUnavailable,
    CircuitOpen,
    RequestCancelled,
    AuthMissingToken,
    AuthInvalidToken,
    AuthInsufficientScope,
    RateLimitExceeded,
    InternalError,
    BodyTooLarge,
    DeadlineExceeded,
}

impl ErrorCode {
    /// The wire form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RouteNotFound => "GATEWAY_ROUTE_NOT_FOUND",
            ErrorCode::MethodNotAllowed => "GATEWAY_METHOD_NOT_ALLOWED",
            ErrorCode::UpstreamUnavailable => "GATEWAY_UPSTREAM_UNAVAILABLE",
            ErrorCode::CircuitOpen => "GATEWAY_CIRCUIT_OPEN",
            ErrorCode::RequestCancelled => "GATEWAY_REQUEST_CANCELLED",
            ErrorCode::AuthMissingToken => "GATEWAY_AUTH_MISSING_TOKEN",
            ErrorCode::AuthInvalidToken => "GATEWAY_AUTH_INVALID_TOKEN",
            ErrorCode::AuthInsufficientScope => "GATEWAY_AUTH_INSUFFICIENT_SCOPE",
            ErrorCode::RateLimitExceeded => "GATEWAY_RATE_LIMIT_EXCEEDED",
            ErrorCode::InternalError => "GATEWAY_INTERNAL_ERROR",
            ErrorCode::BodyTooLarge => "GATEWAY_BODY_TOO_LARGE",
            ErrorCode::DeadlineExceeded => "GATEWAY_DEADLINE_EXCEEDED",
        }
    }

    /// The HTTP status this code is served with.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RequestCancelled => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::AuthMissingToken => StatusCode::UNAUTHORIZED,
            ErrorCode::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::AuthInsufficientScope => StatusCode::FORBIDDEN,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// The canonical human message for this code. Pre-serialized bodies
    /// exist only for code + canonical-message combinations.
    pub fn canonical_message(self) -> &'static str {
        match self {
            ErrorCode::RouteNotFound => "no matching route",
            ErrorCode::MethodNotAllowed => "method not allowed",
            ErrorCode::UpstreamUnavailable => "upstream service unavailable",
            ErrorCode::CircuitOpen => "circuit breaker open",
            ErrorCode::RequestCancelled => "request cancelled",
            ErrorCode::AuthMissingToken => "missing or malformed Authorization header",
            ErrorCode::AuthInvalidToken => "invalid token",
            ErrorCode::AuthInsufficientScope => "insufficient scope",
            ErrorCode::RateLimitExceeded => "rate limit exceeded, retry later",
            ErrorCode::InternalError => "an unexpected error occurred",
            ErrorCode::BodyTooLarge => "request body exceeds maximum allowed size",
            ErrorCode::DeadlineExceeded => "global request deadline exceeded",
        }
    }
}

/// The standardized gateway error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    pub error_code: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<&'a str>,
}

/// A gateway-generated error response.
#[derive(Debug, thiserror::Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl ApiError {
    /// An error with the code's canonical message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.canonical_message().to_string(),
            request_id: None,
        }
    }

    /// An error with a custom human message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the request ID so operators can correlate via logs.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

// Pre-serialized bodies for the hot-path combinations. These carry no
// request_id since that varies per request.
static PRE_ROUTE_NOT_FOUND: Lazy<String> = Lazy::new(|| pre_serialize(ErrorCode::RouteNotFound));
static PRE_UPSTREAM_UNAVAILABLE: Lazy<String> =
    Lazy::new(|| pre_serialize(ErrorCode::UpstreamUnavailable));
static PRE_CIRCUIT_OPEN: Lazy<String> = Lazy::new(|| pre_serialize(ErrorCode::CircuitOpen));
static PRE_REQUEST_CANCELLED: Lazy<String> =
    Lazy::new(|| pre_serialize(ErrorCode::RequestCancelled));
static PRE_AUTH_MISSING_TOKEN: Lazy<String> =
    Lazy::new(|| pre_serialize(ErrorCode::AuthMissingToken));
static PRE_RATE_LIMIT_EXCEEDED: Lazy<String> =
    Lazy::new(|| pre_serialize(ErrorCode::RateLimitExceeded));

fn pre_serialize(code: ErrorCode) -> String {
    let mut body = serde_json::to_string(&ErrorBody {
        error: reason_phrase(code.status()),
        error_code: code.as_str(),
        message: code.canonical_message(),
        request_id: None,
    })
    .expect("static error body serializes");
    body.push('\n');
    body
}

fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

/// Returns the pre-built body for common code + canonical-message pairs.
fn pre_serialized(code: ErrorCode, message: &str) -> Option<&'static str> {
    if message != code.canonical_message() {
        return None;
    }
    match code {
        ErrorCode::RouteNotFound => Some(&PRE_ROUTE_NOT_FOUND),
        ErrorCode::UpstreamUnavailable => Some(&PRE_UPSTREAM_UNAVAILABLE),
        ErrorCode::CircuitOpen => Some(&PRE_CIRCUIT_OPEN),
        ErrorCode::RequestCancelled => Some(&PRE_REQUEST_CANCELLED),
        ErrorCode::AuthMissingToken => Some(&PRE_AUTH_MISSING_TOKEN),
        ErrorCode::RateLimitExceeded => Some(&PRE_RATE_LIMIT_EXCEEDED),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();

        // Fast path: pre-serialized body when there is no request ID.
        let body = if self.request_id.is_none() {
            pre_serialized(self.code, &self.message).map(Body::from)
        } else {
            None
        };

        let body = body.unwrap_or_else(|| {
            let mut serialized = serde_json::to_string(&ErrorBody {
                error: reason_phrase(status),
                error_code: self.code.as_str(),
                message: &self.message,
                request_id: self.request_id.as_deref(),
            })
            .unwrap_or_else(|_| String::from("{}"));
            serialized.push('\n');
            Body::from(serialized)
        });

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap_or_else(|_| status.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::RouteNotFound.as_str(), "GATEWAY_ROUTE_NOT_FOUND");
        assert_eq!(ErrorCode::CircuitOpen.as_str(), "GATEWAY_CIRCUIT_OPEN");
        assert_eq!(
            ErrorCode::DeadlineExceeded.as_str(),
            "GATEWAY_DEADLINE_EXCEEDED"
        );
        assert_eq!(ErrorCode::RouteNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::RateLimitExceeded.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::RequestCancelled.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn response_body_shape() {
        let resp = ApiError::new(ErrorCode::RouteNotFound).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let json = body_json(resp).await;
        assert_eq!(json["error"], "Not Found");
        assert_eq!(json["error_code"], "GATEWAY_ROUTE_NOT_FOUND");
        assert_eq!(json["message"], "no matching route");
        assert!(json.get("request_id").is_none());
    }

    #[tokio::test]
    async fn request_id_included_when_known() {
        let resp = ApiError::new(ErrorCode::CircuitOpen)
            .request_id("abc-123")
            .into_response();
        let json = body_json(resp).await;
        assert_eq!(json["request_id"], "abc-123");
        assert_eq!(json["error_code"], "GATEWAY_CIRCUIT_OPEN");
    }

    #[tokio::test]
    async fn pre_serialized_matches_dynamic() {
        // The fast path and the dynamic path must agree byte-for-byte on shape.
        let fast = body_json(ApiError::new(ErrorCode::RateLimitExceeded).into_response()).await;
        let slow = body_json(
            ApiError::with_message(ErrorCode::RateLimitExceeded, "rate limit exceeded, retry later")
                .into_response(),
        )
        .await;
        assert_eq!(fast, slow);
    }

    #[tokio::test]
    async fn custom_message_skips_fast_path() {
        let resp =
            ApiError::with_message(ErrorCode::MethodNotAllowed, "method POST not allowed for /api")
                .into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        let json = body_json(resp).await;
        assert_eq!(json["message"], "method POST not allowed for /api");
    }
}
