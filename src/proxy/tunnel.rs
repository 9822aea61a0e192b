//! CONNECT tunnels: TLS termination seam and opaque splicing

use std::time::Duration;

use async_trait::async_trait;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{GenproxyError, Result};

/// Client side of an upgraded CONNECT
pub type ClientTunnel = TokioIo<Upgraded>;

/// Byte stream a terminated tunnel is served over
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Terminates the client's TLS session inside a CONNECT tunnel
///
/// Certificate minting and the handshake live behind this trait. The proxy
/// serves HTTP/1 over whatever plaintext stream the terminator returns.
#[async_trait]
pub trait TlsTerminator: Send + Sync {
    /// Accept the client handshake for `authority` and return the plaintext stream
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails; the tunnel is then closed
    async fn terminate(&self, authority: &str, client: ClientTunnel) -> Result<Box<dyn TunnelIo>>;

    /// Scheme of requests arriving over terminated tunnels
    fn scheme(&self) -> &'static str {
        "https"
    }
}

/// Open the server side of an opaque tunnel
///
/// # Errors
///
/// Returns `UpstreamUnavailable` if the destination cannot be reached in time
pub async fn connect_upstream(authority: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(GenproxyError::UpstreamUnavailable(format!(
            "Cannot open tunnel to {authority}: {e}"
        ))),
        Err(_) => Err(GenproxyError::UpstreamUnavailable(format!(
            "Tunnel to {authority} timed out after {timeout:?}"
        ))),
    }
}

/// Copy bytes both ways until either side closes
///
/// # Errors
///
/// Returns the first I/O error on either side
pub async fn splice(mut client: ClientTunnel, mut server: TcpStream) -> Result<()> {
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    debug!("Tunnel closed ({} bytes up, {} bytes down)", sent, received);
    Ok(())
}
