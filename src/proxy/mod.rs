//! Proxy front-end
//!
//! Routes each client request: CONNECT tunnels are decrypted or spliced,
//! unmanaged requests are forwarded live, and managed requests go through
//! the record/playback engine.

mod service;
mod tunnel;

pub use service::{ProxyService, TunnelTask};
pub use tunnel::{connect_upstream, splice, ClientTunnel, TlsTerminator, TunnelIo};
