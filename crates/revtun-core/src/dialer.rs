//! Dialer and authorizer closure types, plus the handshake header names.

use crate::connection::TunnelStream;
use crate::error::TunnelResult;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Header carrying a peer server's id during the upgrade handshake.
pub const HEADER_TUNNEL_ID: &str = "X-Tunnel-ID";
/// Header carrying a peer server's shared token.
pub const HEADER_TUNNEL_TOKEN: &str = "X-API-Tunnel-Token";
/// Header agents use to present their credential to the upgrade authorizer.
pub const HEADER_TUNNEL_SECRET: &str = "X-API-Tunnel-Secret";

/// Per-stream admission predicate: may this session open `(proto, address)`?
pub type ConnectAuthorizer = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Dialer handed to server-side users: opens a tunnel stream to
/// `(proto, address)` through some agent's session.
pub type Dialer = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = TunnelResult<TunnelStream>> + Send>>
        + Send
        + Sync,
>;

/// Anything a local dialer can hand back for piping.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// What a CONNECT resolves to on the receiving side.
pub enum DialedConn {
    /// A real socket (TCP by default).
    Socket(Box<dyn Duplex>),
    /// Another tunnel stream, produced by peer federation when a CONNECT is
    /// forwarded into a different session instead of a local socket.
    Tunnel(TunnelStream),
}

/// Dialer a session uses to satisfy inbound CONNECT frames.
pub type LocalDialer = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = TunnelResult<DialedConn>> + Send>>
        + Send
        + Sync,
>;
