//! Per-request routing: tunnels, live forwarding and the engine

use std::convert::Infallible;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode, Uri};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::tunnel::{self, ClientTunnel, TlsTerminator};
use crate::config::{Config, LimitsConfig, MissPolicy};
use crate::engine::{Engine, Outcome, PlaybackOutcome, RecordOutcome};
use crate::fingerprint::Fingerprint;
use crate::intercept::InterceptionRule;
use crate::message::Request;
use crate::network::{
    create_response, error_response, into_hyper, miss_response, read_body, validate_request,
    ProxyBody, Upstream,
};
use crate::{GenproxyError, Result};

/// Tunnel left to run on a client connection after hyper releases it
pub type TunnelTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Where requests on a terminated tunnel are headed
#[derive(Debug)]
struct TunnelTarget {
    scheme: &'static str,
    authority: String,
}

/// Handles every request arriving at the proxy
///
/// Cheap to clone; one clone serves each connection.
#[derive(Clone)]
pub struct ProxyService {
    engine: Arc<Engine>,
    rule: InterceptionRule,
    upstream: Arc<dyn Upstream>,
    on_miss: MissPolicy,
    miss_status: StatusCode,
    limits: LimitsConfig,
    terminator: Option<Arc<dyn TlsTerminator>>,
    tunnel: Option<Arc<TunnelTarget>>,
    tunnels: Option<mpsc::UnboundedSender<TunnelTask>>,
}

impl ProxyService {
    /// Create the service
    #[must_use]
    pub fn new(
        config: &Config,
        engine: Arc<Engine>,
        rule: InterceptionRule,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            engine,
            rule,
            upstream,
            on_miss: config.playback.on_miss,
            miss_status: StatusCode::from_u16(config.playback.miss_status)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            limits: config.limits.clone(),
            terminator: None,
            tunnel: None,
            tunnels: None,
        }
    }

    /// Decrypt CONNECT tunnels selected by the interception rule
    #[must_use]
    pub fn with_tls_terminator(mut self, terminator: Arc<dyn TlsTerminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Hand accepted CONNECT tunnels to `sink` instead of answering 500
    ///
    /// The owner of the receiving end runs each tunnel, so the tunnel lives
    /// as long as, and is counted as, the client connection it came from.
    #[must_use]
    pub fn with_tunnel_sink(mut self, sink: mpsc::UnboundedSender<TunnelTask>) -> Self {
        self.tunnels = Some(sink);
        self
    }

    /// Handle one request from a client connection
    pub async fn handle<B>(&self, req: hyper::Request<B>) -> hyper::Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if req.method() == Method::CONNECT {
            return self.connect(req).await;
        }
        self.proxy(req).await
    }

    async fn connect<B>(&self, req: hyper::Request<B>) -> hyper::Response<ProxyBody>
    where
        B: Send + 'static,
    {
        let Some(authority) = req.uri().authority().map(ToString::to_string) else {
            return error_response(&GenproxyError::BadRequest(format!(
                "CONNECT target must be host:port, got {}",
                req.uri()
            )));
        };

        let terminator = self
            .terminator
            .clone()
            .filter(|_| self.rule.should_intercept(&authority));

        let task: TunnelTask = if let Some(terminator) = terminator {
            debug!("Intercepting tunnel to {}", authority);
            let service = self.clone();
            Box::pin(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        service
                            .serve_intercepted(terminator, authority, TokioIo::new(upgraded))
                            .await;
                    }
                    Err(e) => warn!("CONNECT upgrade failed for {}: {}", authority, e),
                }
            })
        } else {
            let server =
                match tunnel::connect_upstream(&authority, self.limits.upstream_timeout()).await {
                    Ok(server) => server,
                    Err(e) => {
                        warn!("{}", e);
                        return error_response(&e);
                    }
                };

            debug!("Opaque tunnel to {}", authority);
            Box::pin(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        if let Err(e) = tunnel::splice(TokioIo::new(upgraded), server).await {
                            debug!("Tunnel to {} ended: {}", authority, e);
                        }
                    }
                    Err(e) => warn!("CONNECT upgrade failed for {}: {}", authority, e),
                }
            })
        };

        let Some(sink) = &self.tunnels else {
            return error_response(&GenproxyError::Config(
                "CONNECT received without a connection to run the tunnel on".to_string(),
            ));
        };
        if sink.send(task).is_err() {
            return error_response(&GenproxyError::Io(std::io::ErrorKind::BrokenPipe.into()));
        }

        create_response(StatusCode::OK, Bytes::new())
    }

    async fn serve_intercepted(
        self,
        terminator: Arc<dyn TlsTerminator>,
        authority: String,
        client: ClientTunnel,
    ) {
        let stream = match terminator.terminate(&authority, client).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("TLS termination failed for {}: {}", authority, e);
                return;
            }
        };

        let service = Self {
            tunnel: Some(Arc::new(TunnelTarget {
                scheme: terminator.scheme(),
                authority: authority.clone(),
            })),
            ..self
        };
        let handler = service_fn(move |req: hyper::Request<Incoming>| {
            let service = service.clone();
            async move {
                if req.method() == Method::CONNECT {
                    let error = GenproxyError::BadRequest("CONNECT inside a tunnel".to_string());
                    return Ok::<_, Infallible>(error_response(&error));
                }
                Ok(service.proxy(req).await)
            }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), handler)
            .await
        {
            debug!("Intercepted connection to {} closed: {}", authority, e);
        }
    }

    async fn proxy<B>(&self, req: hyper::Request<B>) -> hyper::Response<ProxyBody>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        match self.build_request(req).await {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                debug!("Rejected request: {}", e);
                error_response(&e)
            }
        }
    }

    async fn build_request<B>(&self, req: hyper::Request<B>) -> Result<Request>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        validate_request(req.headers(), &self.limits)?;

        let (parts, body) = req.into_parts();
        let body = read_body(body, self.limits.max_request_size).await?;
        let uri = self.absolute_uri(&parts.uri, &parts.headers)?;

        Ok(Request {
            method: parts.method,
            uri,
            headers: parts.headers,
            body,
        })
    }

    /// Resolve the request target to an absolute URI
    ///
    /// Absolute-form targets are used as sent. Origin-form targets take the
    /// tunnel's authority when inside one, else the `Host` header.
    fn absolute_uri(&self, uri: &Uri, headers: &HeaderMap) -> Result<Uri> {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Ok(uri.clone());
        }

        let (scheme, authority) = match &self.tunnel {
            Some(target) => (target.scheme, target.authority.as_str()),
            None => {
                let host = headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        GenproxyError::BadRequest(
                            "Request has neither an absolute URI nor a Host header".to_string(),
                        )
                    })?;
                ("http", host)
            }
        };

        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| GenproxyError::BadRequest(format!("Cannot build target URI: {e}")))
    }

    async fn dispatch(&self, request: Request) -> hyper::Response<ProxyBody> {
        if !self.rule.is_managed(&request) {
            debug!("Unmanaged {} {}, forwarding live", request.method, request.uri);
            return self.forward_live(&request).await;
        }

        match self.engine.handle(&request).await {
            Outcome::Record(RecordOutcome::Forwarded { response, .. })
            | Outcome::Playback(PlaybackOutcome::Hit(response)) => into_hyper(response),
            Outcome::Record(RecordOutcome::UpstreamFailed(e)) => error_response(&e),
            Outcome::Playback(PlaybackOutcome::NotFound(key)) => self.on_miss(&request, &key).await,
        }
    }

    async fn forward_live(&self, request: &Request) -> hyper::Response<ProxyBody> {
        match self.upstream.forward(request).await {
            Ok(response) => into_hyper(response),
            Err(e) => {
                warn!("Forwarding {} {} failed: {}", request.method, request.uri, e);
                error_response(&e)
            }
        }
    }

    async fn on_miss(&self, request: &Request, key: &Fingerprint) -> hyper::Response<ProxyBody> {
        match self.on_miss {
            MissPolicy::Error => miss_response(self.miss_status, key.as_str()),
            MissPolicy::Passthrough => {
                info!(
                    "Passing unrecorded {} {} through to upstream",
                    request.method, request.uri
                );
                self.forward_live(request).await
            }
        }
    }
}
