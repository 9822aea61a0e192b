//! Network layer for genproxy
//!
//! Owns the listener, per-connection serving with bounded concurrency, the
//! upstream HTTP client and the response helpers shared by all of them.

mod client;
mod http;
mod limiter;
mod server;

pub use self::client::{HttpClient, Upstream};
pub use self::http::{
    create_response, error_response, into_hyper, miss_response, read_body, strip_hop_by_hop,
    validate_request, ProxyBody, FINGERPRINT_HEADER, HOP_BY_HOP_HEADERS,
};
pub use self::limiter::{ConnectionLimiter, ConnectionSlot};
pub use self::server::ProxyServer;

/// Time allowed for open connections to finish after shutdown
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
