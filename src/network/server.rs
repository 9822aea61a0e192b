//! Listener and per-connection serving

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::limiter::ConnectionLimiter;
use super::{Upstream, SHUTDOWN_TIMEOUT_MS};
use crate::config::Config;
use crate::engine::Engine;
use crate::intercept::InterceptionRule;
use crate::proxy::{ProxyService, TlsTerminator};
use crate::{GenproxyError, Result};

/// Proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    service: ProxyService,
    limiter: ConnectionLimiter,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Bind the listen address from `config`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the address cannot be bound or the
    /// connection limit is invalid
    pub async fn bind(
        config: &Config,
        engine: Arc<Engine>,
        rule: InterceptionRule,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        let limiter = ConnectionLimiter::new(config.limits.max_connections)?;
        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            GenproxyError::Config(format!("Cannot listen on {}: {e}", config.listen_addr))
        })?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            service: ProxyService::new(config, engine, rule, upstream),
            limiter,
            shutdown_tx,
        })
    }

    /// Decrypt intercepted CONNECT tunnels with `terminator`
    #[must_use]
    pub fn with_tls_terminator(mut self, terminator: Arc<dyn TlsTerminator>) -> Self {
        self.service = self.service.with_tls_terminator(terminator);
        self
    }

    /// Address actually bound, useful when listening on port 0
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` completes, then drain open connections
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and retried
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Some(slot) = self.limiter.try_acquire() else {
                                warn!(
                                    "Connection limit of {} reached, rejecting {}",
                                    self.limiter.max_connections(),
                                    peer
                                );
                                continue;
                            };

                            let service = self.service.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            connections.spawn(async move {
                                let _slot = slot;
                                serve_connection(stream, peer, service, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        warn!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!(
            "Draining {} open connections",
            self.limiter.active_connections()
        );
        self.shutdown_tx.send(()).ok();

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Aborting {} connections still open after {:?}",
                connections.len(),
                shutdown_timeout
            );
            connections.abort_all();
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Serve one client connection, then any tunnel its CONNECT opened
///
/// The tunnel runs inside the connection's task, so it keeps the
/// connection's slot and ends with it at shutdown.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: ProxyService,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Accepted connection from {}", peer);

    let (tunnel_tx, mut tunnel_rx) = mpsc::unbounded_channel();
    let service = service.with_tunnel_sink(tunnel_tx);
    let handler = service_fn(move |req: hyper::Request<Incoming>| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.handle(req).await) }
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), handler)
        .with_upgrades();
    tokio::pin!(conn);

    let shutting_down = tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Connection from {} closed with error: {}", peer, e);
            }
            false
        }
        _ = shutdown_rx.recv() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!("Connection from {} closed during shutdown: {}", peer, e);
            }
            true
        }
    };

    let Ok(tunnel) = tunnel_rx.try_recv() else {
        return;
    };
    if shutting_down {
        debug!("Dropping tunnel from {} during shutdown", peer);
        return;
    }

    tokio::select! {
        () = tunnel => debug!("Tunnel from {} closed", peer),
        _ = shutdown_rx.recv() => debug!("Closing tunnel from {} for shutdown", peer),
    }
}
