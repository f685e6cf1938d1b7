//! Global request deadline.
//!
//! The inner stack runs as its own task racing a timer. A single atomic
//! flag, claimed by compare-and-swap, decides which side produces the
//! response: at most one of "handler response" and "504 deadline
//! response" ever reaches the client. When the deadline wins it cancels
//! the per-request token (stopping the retry loop mid-flight) and the
//! inner task is drained in the background rather than dropped.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::Request, middleware::Next, response::{IntoResponse, Response}};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::middleware::request_id::RequestId,
    error::{ApiError, ErrorCode},
};

async fn deadline_middleware(timeout: Duration, mut req: Request, next: Next) -> Response {
    let request_id = req.extensions().get::<RequestId>().map(|id| id.0.clone());

    let token = CancellationToken::new();
    req.extensions_mut().insert(token.clone());

    let claimed = Arc::new(AtomicBool::new(false));
    let mut inner = tokio::spawn(next.run(req));

    tokio::select! {
        result = &mut inner => {
            if claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The deadline side already answered the client.
                return deadline_response(&request_id);
            }
            match result {
                Ok(response) => response,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "request task failed");
                    ApiError::new(ErrorCode::InternalError).into_response()
                }
            }
        }
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            if claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Lost the race after all; take the handler's response.
                return match inner.await {
                    Ok(response) => response,
                    Err(_) => ApiError::new(ErrorCode::InternalError).into_response(),
                };
            }
            // Drain the inner task so its work is not torn down mid-poll.
            tokio::spawn(async move {
                let _ = inner.await;
            });
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "global deadline exceeded");
            deadline_response(&request_id)
        }
    }
}

fn deadline_response(request_id: &Option<String>) -> Response {
    let err = ApiError::new(ErrorCode::DeadlineExceeded);
    match request_id {
        Some(id) => err.request_id(id.clone()),
        None => err,
    }
    .into_response()
}

/// Cloneable closure wrapping [`deadline_middleware`]. The gateway only
/// installs this layer when a global timeout is configured.
pub fn create_deadline_middleware(
    timeout: Duration,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| Box::pin(deadline_middleware(timeout, req, next))
}
