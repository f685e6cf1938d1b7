//! Gantry — an HTTP/1.1 reverse-proxy gateway.
//!
//! Gantry sits at the edge of a cluster of internal services and
//! concentrates the cross-cutting concerns backends should not carry
//! themselves: authentication, per-client rate budgets, load shedding,
//! TLS termination, and observability.
//!
//! # Features
//! - Longest-prefix routing with path-segment boundary enforcement
//! - Per-client token-bucket rate limiting with trusted-proxy
//!   `X-Forwarded-For` resolution and per-route overrides
//! - Reverse proxying with retries, full response buffering on
//!   non-final attempts, and per-backend connection pools
//! - Composite circuit breakers (failure-rate core with optional
//!   slow-call, bulkhead, and latency-adaptive layers)
//! - Global request deadline with single-writer response claiming
//! - JWT (HS256) Bearer authentication with scope enforcement
//! - Live configuration hot-reload behind an atomic snapshot pointer
//! - Prometheus metrics, structured JSON logs, liveness/readiness probes
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) and keeps pure request-admission logic in `core`.
//! The binary wires everything together in `main.rs`; embedders can
//! call [`gateway::build_gateway`] with their own
//! [`ports::http_client::HttpClient`] to drive the same stack in-process.
//!
//! # Error Handling
//! Client-facing failures go through the stable [`error::ErrorCode`]
//! taxonomy; everything the binary can hit at startup returns
//! `eyre::Result` with context attached.

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{CertLoader, PooledHttpClient, ProxyRouter},
    config::{Config, Reloader},
    core::{CompositeBreaker, RateLimiter, RouteTable},
    error::{ApiError, ErrorCode},
    gateway::{build_gateway, register_reload_appliers, GatewayParts},
    ports::http_client::HttpClient,
    utils::Shutdown,
};
