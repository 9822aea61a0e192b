//! HTTP client for forwarding requests to their real destination

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use super::http::strip_hop_by_hop;
use crate::config::LimitsConfig;
use crate::message::{Request, Response};
use crate::{GenproxyError, Result};

/// Capability to send a request to its real destination
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send a copy of `request` and return the complete response
    ///
    /// # Errors
    ///
    /// Returns `UpstreamUnavailable` on connection failure, timeout or an
    /// unreadable response
    async fn forward(&self, request: &Request) -> Result<Response>;
}

/// Plain-HTTP upstream client
///
/// TLS destinations need a TLS-capable [`Upstream`] supplied alongside the
/// interception layer; this client refuses them.
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client
    #[must_use]
    pub fn new(timeout: Duration, max_response_size: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self {
            client,
            timeout,
            max_response_size,
        }
    }

    /// Create a client using the `[limits]` settings
    #[must_use]
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(limits.upstream_timeout(), limits.max_response_size)
    }

    async fn send(&self, request: &Request) -> Result<Response> {
        if request.uri.scheme_str() != Some("http") {
            return Err(GenproxyError::UpstreamUnavailable(format!(
                "Unsupported upstream scheme for {}",
                request.uri
            )));
        }

        let mut outbound = hyper::Request::new(Full::new(request.body.clone()));
        *outbound.method_mut() = request.method.clone();
        *outbound.uri_mut() = request.uri.clone();
        *outbound.headers_mut() = request.headers.clone();
        strip_hop_by_hop(outbound.headers_mut());

        let response = self.client.request(outbound).await.map_err(|e| {
            warn!("Request failed: {e}");
            GenproxyError::UpstreamUnavailable(format!("Request to {} failed: {e}", request.uri))
        })?;

        let (parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_response_size)
            .collect()
            .await
            .map_err(|e| {
                GenproxyError::UpstreamUnavailable(format!("Failed to read response body: {e}"))
            })?
            .to_bytes();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        Ok(Response {
            status: parts.status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Upstream for HttpClient {
    async fn forward(&self, request: &Request) -> Result<Response> {
        debug!("Forwarding {} {}", request.method, request.uri);

        tokio::time::timeout(self.timeout, self.send(request))
            .await
            .map_err(|_| {
                GenproxyError::UpstreamUnavailable(format!(
                    "Request to {} timed out after {:?}",
                    request.uri, self.timeout
                ))
            })?
    }
}
