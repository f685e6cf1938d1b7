//! Structured request logging.
//!
//! One record per request: method, path, status, latency, client IP, and
//! request ID, emitted at the matched route's configured level. A route
//! level of `none` suppresses the record entirely. Body logging is
//! opt-in: up to `max_body_log_bytes` of request and response bodies are
//! captured when the content type is text-like, with common sensitive
//! JSON fields redacted in a single compiled-pattern pass. Capture
//! buffers are pooled.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Instant,
};

use arc_swap::ArcSwap;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
    http::header,
    middleware::Next,
    response::Response,
};
use http_body::Frame;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    adapters::middleware::request_id::RequestId,
    adapters::tls::ClientAddr,
    config::RouteConfig,
    core::routing::matches_prefix,
};

/// Per-route log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteLogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Suppress the request record entirely.
    None,
}

impl RouteLogLevel {
    /// Empty and unknown strings fall back to Info.
    pub fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "debug" => RouteLogLevel::Debug,
            "warn" => RouteLogLevel::Warn,
            "error" => RouteLogLevel::Error,
            "none" => RouteLogLevel::None,
            _ => RouteLogLevel::Info,
        }
    }
}

/// Path → log level lookup table, hot-swapped on reload. Readers never
/// lock; the reload applier publishes a new table with a single store.
pub struct LogLevelTable {
    entries: ArcSwap<Vec<(String, RouteLogLevel)>>,
}

impl LogLevelTable {
    pub fn new(routes: &[RouteConfig]) -> Self {
        Self {
            entries: ArcSwap::from_pointee(Self::build(routes)),
        }
    }

    pub fn update(&self, routes: &[RouteConfig]) {
        self.entries.store(Arc::new(Self::build(routes)));
    }

    fn build(routes: &[RouteConfig]) -> Vec<(String, RouteLogLevel)> {
        routes
            .iter()
            .map(|r| (r.path_prefix.clone(), RouteLogLevel::parse(&r.log_level)))
            .collect()
    }

    /// Longest boundary-matching prefix wins; unmatched paths log at Info.
    pub fn lookup(&self, path: &str) -> RouteLogLevel {
        let entries = self.entries.load();
        let mut best_len = 0;
        let mut level = RouteLogLevel::Info;
        for (prefix, entry_level) in entries.iter() {
            if matches_prefix(path, prefix) && prefix.len() > best_len {
                best_len = prefix.len();
                level = *entry_level;
            }
        }
        level
    }
}

/// Opt-in body capture settings.
#[derive(Debug, Clone, Copy)]
pub struct BodyLogSettings {
    pub max_bytes: usize,
}

/// Matches JSON key/value pairs for common sensitive fields, compiled
/// once. Single-pass replacement; the key survives, the value becomes
/// `***`.
static SENSITIVE_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)("(?:password|secret|token|key|authorization)"\s*:\s*")[^"]*(")"#)
        .expect("sensitive field regex")
});

/// Replace sensitive JSON field values with `***`.
pub fn redact_sensitive(s: &str) -> String {
    SENSITIVE_FIELD_RE.replace_all(s, "$1***$2").into_owned()
}

/// Whether a content type is text-like enough to capture.
fn should_log_body(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("json")
        || ct.starts_with("text/")
        || ct.contains("xml")
        || ct.contains("form-urlencoded")
}

/// Reusable capture buffers; contents are copied into the log record and
/// the allocation goes back to the pool.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_default()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        if buffers.len() < 64 {
            buffers.push(buf);
        }
    }
}

static CAPTURE_POOL: Lazy<BufferPool> = Lazy::new(|| BufferPool {
    buffers: Mutex::new(Vec::new()),
});

/// Shared capture target for one body direction.
type CaptureSink = Arc<Mutex<Vec<u8>>>;

fn new_sink() -> CaptureSink {
    Arc::new(Mutex::new(CAPTURE_POOL.acquire()))
}

/// Drain the sink into a redacted string and recycle the buffer.
fn take_sink(sink: &CaptureSink) -> String {
    let mut guard = sink.lock().expect("capture sink poisoned");
    let buf = std::mem::take(&mut *guard);
    let text = String::from_utf8_lossy(&buf).into_owned();
    CAPTURE_POOL.release(buf);
    redact_sensitive(&text)
}

/// Tee body: forwards frames unchanged while copying up to `max` bytes
/// into the sink. `on_end` fires exactly once when the stream finishes
/// (or the body is dropped early by a disconnecting client).
struct CaptureBody {
    inner: Body,
    sink: CaptureSink,
    max: usize,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureBody {
    fn new(inner: Body, sink: CaptureSink, max: usize, on_end: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self {
            inner,
            sink,
            max,
            on_end,
        }
    }

    fn finish(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

impl http_body::Body for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    let mut buf = this.sink.lock().expect("capture sink poisoned");
                    let remaining = this.max.saturating_sub(buf.len());
                    if remaining > 0 {
                        let take = remaining.min(data.len());
                        buf.extend_from_slice(&data[..take]);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[allow(clippy::too_many_arguments)]
fn emit(
    level: RouteLogLevel,
    method: &str,
    path: &str,
    status: u16,
    latency_ms: u64,
    client_ip: &str,
    request_id: &str,
    request_body: &str,
    response_body: &str,
) {
    macro_rules! log_at {
        ($lvl:expr) => {
            tracing::event!(
                $lvl,
                method = %method,
                path = %path,
                status = status,
                latency_ms = latency_ms,
                client_ip = %client_ip,
                request_id = %request_id,
                request_body = %request_body,
                response_body = %response_body,
                "request"
            )
        };
    }

    match level {
        RouteLogLevel::Debug => log_at!(tracing::Level::DEBUG),
        RouteLogLevel::Info => log_at!(tracing::Level::INFO),
        RouteLogLevel::Warn => log_at!(tracing::Level::WARN),
        RouteLogLevel::Error => log_at!(tracing::Level::ERROR),
        RouteLogLevel::None => {}
    }
}

async fn logging_middleware(
    levels: Arc<LogLevelTable>,
    body_settings: Option<BodyLogSettings>,
    req: Request,
    next: Next,
) -> Response {
    let level = levels.lookup(req.uri().path());
    if level == RouteLogLevel::None {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<ClientAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_default();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    // Optionally tee the request body. The proxy buffers the inbound
    // body before its first attempt, so the sink is complete by the time
    // the record is emitted.
    let request_sink = body_settings.and_then(|settings| {
        let text_like = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(should_log_body);
        if !text_like {
            return None;
        }
        let sink = new_sink();
        Some((sink, settings.max_bytes))
    });

    let req = match &request_sink {
        Some((sink, max)) => {
            let (parts, body) = req.into_parts();
            let teed = Body::new(CaptureBody::new(body, Arc::clone(sink), *max, None));
            Request::from_parts(parts, teed)
        }
        None => req,
    };

    let response = next.run(req).await;
    let status = response.status().as_u16();

    let request_body = request_sink
        .as_ref()
        .map(|(sink, _)| take_sink(sink))
        .unwrap_or_default();

    // With body logging on and a text-like response, defer the record to
    // the end of the response stream so the captured body is complete.
    if let Some(settings) = body_settings {
        let text_like = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(should_log_body);
        if text_like {
            let sink = new_sink();
            let record_sink = Arc::clone(&sink);
            let on_end: Box<dyn FnOnce() + Send> = Box::new(move || {
                let response_body = take_sink(&record_sink);
                emit(
                    level,
                    &method,
                    &path,
                    status,
                    start.elapsed().as_millis() as u64,
                    &client_ip,
                    &request_id,
                    &request_body,
                    &response_body,
                );
            });

            let (parts, body) = response.into_parts();
            let teed = Body::new(CaptureBody::new(body, sink, settings.max_bytes, Some(on_end)));
            return Response::from_parts(parts, teed);
        }
    }

    emit(
        level,
        &method,
        &path,
        status,
        start.elapsed().as_millis() as u64,
        &client_ip,
        &request_id,
        &request_body,
        "",
    );
    response
}

/// Cloneable closure wrapping the logging middleware.
pub fn create_logging_middleware(
    levels: Arc<LogLevelTable>,
    body_settings: Option<BodyLogSettings>,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| {
        let levels = Arc::clone(&levels);
        Box::pin(logging_middleware(levels, body_settings, req, next))
    }
}
