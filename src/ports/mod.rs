//! Ports: trait seams between the core and the outside world.

pub mod http_client;

pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
