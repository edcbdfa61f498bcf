//! Logical streams inside a session.
//!
//! A [`TunnelStream`] is the user-facing handle: a connection-shaped object
//! with explicit async read/write, addresses, and deadline setters. The
//! inner [`Connection`] holds the per-stream state machine (read buffer,
//! back-pressure latch, closed flag) and a weak pointer back to its session;
//! a stream never keeps its session alive.

use crate::backpressure::BackPressure;
use crate::error::{TunnelError, TunnelResult};
use crate::message::Message;
use crate::readbuffer::{FlowSignal, ReadBuffer};
use crate::session::Session;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

/// The `(proto, address)` a stream was opened against, surfaced as both its
/// local and remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddr {
    proto: String,
    address: String,
}

impl TunnelAddr {
    pub fn network(&self) -> &str {
        &self.proto
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

pub(crate) struct Connection {
    conn_id: i64,
    addr: TunnelAddr,
    session: Weak<Session>,
    buffer: ReadBuffer,
    back_pressure: BackPressure,
    closed: AtomicBool,
    write_deadline: Mutex<Option<Instant>>,
}

impl Connection {
    pub fn new(conn_id: i64, session: &Arc<Session>, proto: &str, address: &str) -> Arc<Self> {
        let tunables = session.tunables();
        let conn = Arc::new(Self {
            conn_id,
            addr: TunnelAddr {
                proto: proto.to_string(),
                address: address.to_string(),
            },
            session: Arc::downgrade(session),
            buffer: ReadBuffer::new(tunables.high_water, tunables.low_water),
            back_pressure: BackPressure::new(),
            closed: AtomicBool::new(false),
            write_deadline: Mutex::new(None),
        });
        session
            .metrics()
            .connection_added(session.client_key(), proto, address);
        conn
    }

    pub fn conn_id(&self) -> i64 {
        self.conn_id
    }

    pub(crate) fn session(&self) -> TunnelResult<Arc<Session>> {
        self.session.upgrade().ok_or(TunnelError::ClosedPipe)
    }

    /// Inbound DATA: queue the body, and PAUSE the peer if the buffer just
    /// crossed its high watermark.
    pub async fn on_data(&self, body: Bytes) {
        let max_chunk = match self.session() {
            Ok(s) => s.tunables().max_read,
            Err(_) => return,
        };
        trace!(conn_id = self.conn_id, buffered = self.buffer.len(), "data");
        if let Some(FlowSignal::Pause) = self.buffer.offer(body, max_chunk) {
            self.send_flow(FlowSignal::Pause).await;
        }
    }

    pub fn on_pause(&self) {
        self.back_pressure.on_pause();
    }

    pub fn on_resume(&self) {
        self.back_pressure.on_resume();
    }

    async fn send_flow(&self, signal: FlowSignal) {
        let Ok(session) = self.session() else { return };
        let msg = match signal {
            FlowSignal::Pause => Message::pause(session.next_message_id(), self.conn_id),
            FlowSignal::Resume => Message::resume(session.next_message_id(), self.conn_id),
        };
        let deadline = *self.write_deadline.lock().unwrap();
        if let Err(e) = session.write_message(deadline, msg).await {
            trace!(conn_id = self.conn_id, error = %e, "flow-control write failed");
        }
    }

    /// Best-effort terminal ERROR to the peer. `None` reports a clean EOF.
    pub async fn write_err(&self, err: Option<&TunnelError>) {
        let Ok(session) = self.session() else { return };
        let msg = Message::error(session.next_message_id(), self.conn_id, err);
        session
            .metrics()
            .error_bytes_sent(session.client_key(), msg.body.len() as u64);
        let deadline = Instant::now() + session.tunables().send_error_timeout;
        if let Err(write_err) = session.write_message(Some(deadline), msg).await {
            warn!(
                conn_id = self.conn_id,
                error = %write_err,
                "failed to send close error to peer"
            );
        }
    }

    /// Tear down with notification: send the terminal ERROR, then flip
    /// local state.
    pub async fn tunnel_close(&self, err: Option<TunnelError>) {
        self.write_err(err.as_ref()).await;
        self.do_tunnel_close(err);
    }

    /// Flip local state only. Idempotent; later calls are no-ops.
    pub fn do_tunnel_close(&self, err: Option<TunnelError>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Ok(session) = self.session() {
            session.metrics().connection_removed(
                session.client_key(),
                self.addr.network(),
                self.addr.address(),
            );
        }
        self.buffer.close(err);
        self.back_pressure.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A bidirectional byte stream multiplexed over a session's transport.
///
/// Clones share the same underlying stream.
#[derive(Clone)]
pub struct TunnelStream {
    conn: Arc<Connection>,
}

impl TunnelStream {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// The stream id within its session.
    pub fn id(&self) -> i64 {
        self.conn.conn_id
    }

    pub fn local_addr(&self) -> &TunnelAddr {
        &self.conn.addr
    }

    pub fn remote_addr(&self) -> &TunnelAddr {
        &self.conn.addr
    }

    /// Read buffered stream bytes, blocking until data, EOF (`Ok(0)`),
    /// the terminal error, a deadline, or the idle timeout.
    ///
    /// Cancel-safe: once bytes are copied out there are no further await
    /// points, so dropping the future never loses data.
    pub async fn read(&self, buf: &mut [u8]) -> TunnelResult<usize> {
        let (n, signal) = self.conn.buffer.read(buf).await?;
        if let Ok(session) = self.conn.session() {
            session.metrics().bytes_received(session.client_key(), n as u64);
        }
        if let Some(FlowSignal::Resume) = signal {
            let conn = self.conn.clone();
            tokio::spawn(async move {
                conn.send_flow(FlowSignal::Resume).await;
            });
        }
        Ok(n)
    }

    /// Send `buf` as one DATA frame.
    ///
    /// Blocks while the peer has the stream paused. A write-deadline expiry
    /// closes the whole stream: a timed-out frame write leaves the transport
    /// in an unknown partial state.
    pub async fn write(&self, buf: &[u8]) -> TunnelResult<usize> {
        let conn = &self.conn;
        if conn.is_closed() {
            return Err(TunnelError::ClosedPipe);
        }
        let session = conn.session()?;
        let deadline = *conn.write_deadline.lock().unwrap();

        let send = async {
            conn.back_pressure.wait().await?;
            let msg = Message::data(
                session.next_message_id(),
                conn.conn_id,
                Bytes::copy_from_slice(buf),
            );
            session.write_message(None, msg).await
        };

        let result = match deadline {
            Some(d) => match tokio::time::timeout_at(d, send).await {
                Ok(r) => r,
                Err(_) => {
                    self.close().await;
                    return Err(TunnelError::Timeout);
                }
            },
            None => send.await,
        };
        result?;

        session.metrics().bytes_sent(session.client_key(), buf.len() as u64);
        Ok(buf.len())
    }

    /// Local close: deregister from the session and tell the peer the
    /// stream ended cleanly. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(session) = self.conn.session.upgrade() {
            session.close_connection(self.conn.conn_id, None).await;
        } else {
            self.conn.do_tunnel_close(None);
        }
    }

    /// Set both read and write deadlines. `None` disables.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.conn.buffer.set_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.conn.write_deadline.lock().unwrap() = deadline;
    }

    /// Idle timeout applied to each read call independently of the
    /// absolute deadline.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.conn.buffer.set_read_timeout(timeout);
    }
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("conn_id", &self.conn.conn_id)
            .field("addr", &self.conn.addr)
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}
