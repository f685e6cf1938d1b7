//! Panic recovery.
//!
//! Catches any panic escaping a downstream handler, logs it with the
//! request coordinates, and answers 500 without leaking internals.

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;

use crate::error::{ApiError, ErrorCode};

pub async fn recovery_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    // RequestID runs inside this layer, so only a client-supplied ID is
    // available at panic time.
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match std::panic::AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                method = %method,
                path = %path,
                request_id = request_id.as_deref().unwrap_or(""),
                panic = %message,
                "panic recovered"
            );
            let err = ApiError::new(ErrorCode::InternalError);
            match request_id {
                Some(id) => err.request_id(id),
                None => err,
            }
            .into_response()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
