//! Honoring inbound CONNECT frames: dial the requested endpoint and pump
//! bytes between it and the tunnel stream.
//!
//! The terminal ERROR frame for the stream is sent only after both copy
//! directions have quiesced, so it can never overtake trailing DATA.

use crate::connection::TunnelStream;
use crate::dialer::{DialedConn, Duplex, LocalDialer};
use crate::error::{TunnelError, TunnelResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const PIPE_BUF: usize = 8192;

/// Dial the CONNECT target and relay until either side ends. Runs as its
/// own task; owns the stream's teardown.
pub(crate) async fn client_dial(
    dialer: Option<LocalDialer>,
    stream: TunnelStream,
    proto: String,
    address: String,
    dial_timeout: Duration,
) {
    let dial = async {
        match &dialer {
            Some(dial) => dial(proto.clone(), address.clone()).await,
            None => default_tcp_dial(&proto, &address).await,
        }
    };

    let err = match tokio::time::timeout(dial_timeout, dial).await {
        Ok(Ok(DialedConn::Socket(sock))) => pipe_socket(&stream, sock).await,
        Ok(Ok(DialedConn::Tunnel(other))) => pipe_tunnel(&stream, other).await,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(TunnelError::Timeout),
    };

    if let Some(e) = &err {
        debug!(%proto, %address, error = %e, "tunneled connection ended");
    }

    // Deregister, flip local state, and notify the peer exactly once, now
    // that no more DATA can be emitted for this stream.
    let conn = stream.connection().clone();
    if let Ok(session) = conn.session() {
        session.remove_connection(conn.conn_id());
    }
    conn.do_tunnel_close(err.clone());
    conn.write_err(err.as_ref()).await;
}

/// The fallback dialer: plain TCP.
pub async fn default_tcp_dial(proto: &str, address: &str) -> TunnelResult<DialedConn> {
    if proto != "tcp" {
        return Err(TunnelError::Other(format!(
            "unsupported protocol for local dial: {proto}"
        )));
    }
    let sock = TcpStream::connect(address).await?;
    Ok(DialedConn::Socket(Box::new(sock)))
}

/// Relay stream <-> socket until one direction ends. Returns the first
/// error, or `None` for a clean EOF.
async fn pipe_socket(stream: &TunnelStream, mut sock: Box<dyn Duplex>) -> Option<TunnelError> {
    let mut stream_buf = vec![0u8; PIPE_BUF];
    let mut sock_buf = vec![0u8; PIPE_BUF];

    let err = loop {
        tokio::select! {
            from_stream = stream.read(&mut stream_buf) => match from_stream {
                Ok(0) => break None,
                Ok(n) => {
                    if let Err(e) = sock.write_all(&stream_buf[..n]).await {
                        break Some(TunnelError::from(e));
                    }
                }
                Err(e) => break Some(e),
            },
            from_sock = sock.read(&mut sock_buf) => match from_sock {
                Ok(0) => break None,
                Ok(n) => {
                    if let Err(e) = stream.write(&sock_buf[..n]).await {
                        break Some(e);
                    }
                }
                Err(e) => break Some(TunnelError::from(e)),
            },
        }
    };

    let _ = sock.shutdown().await;
    err
}

/// Relay between two tunnel streams: the peer-federation path, where an
/// inbound CONNECT is forwarded into another agent's session.
async fn pipe_tunnel(stream: &TunnelStream, other: TunnelStream) -> Option<TunnelError> {
    let mut inbound = vec![0u8; PIPE_BUF];
    let mut outbound = vec![0u8; PIPE_BUF];

    let err = loop {
        tokio::select! {
            from_stream = stream.read(&mut inbound) => match from_stream {
                Ok(0) => break None,
                Ok(n) => {
                    if let Err(e) = other.write(&inbound[..n]).await {
                        break Some(e);
                    }
                }
                Err(e) => break Some(e),
            },
            from_other = other.read(&mut outbound) => match from_other {
                Ok(0) => break None,
                Ok(n) => {
                    if let Err(e) = stream.write(&outbound[..n]).await {
                        break Some(e);
                    }
                }
                Err(e) => break Some(e),
            },
        }
    };

    other.close().await;
    err
}
