//! revtun-core: the multiplexing heart of the revtun reverse tunnel.
//!
//! One message-framed transport (typically a WebSocket an agent dialed out
//! to a server) carries many independent, ordered byte streams. This crate
//! provides the frame codec, the per-stream read buffer and flow control,
//! the stream handle, and the session state machine that ties them
//! together. The HTTP upgrade, authentication of the handshake, and
//! listener plumbing live in the `revtun-server` and `revtun-client`
//! crates.

mod backpressure;
mod connection;
mod dialer;
mod error;
mod localdial;
mod message;
mod metrics;
mod readbuffer;
mod session;
mod sync;
mod transport;
mod tunables;

pub use connection::{TunnelAddr, TunnelStream};
pub use dialer::{
    ConnectAuthorizer, DialedConn, Dialer, Duplex, LocalDialer, HEADER_TUNNEL_ID,
    HEADER_TUNNEL_SECRET, HEADER_TUNNEL_TOKEN,
};
pub use error::{TunnelError, TunnelResult};
pub use localdial::default_tcp_dial;
pub use message::{Message, MessageType};
pub use metrics::{NoopMetrics, TunnelMetrics};
pub use session::Session;
pub use sync::{decode_connection_ids, encode_connection_ids};
pub use transport::{websocket_transport, FrameSink, FrameSource};
pub use tunables::Tunables;
