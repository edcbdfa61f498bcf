//! The multiplexing session: one transport, many logical streams.
//!
//! A session drives a read loop over its frame source, demultiplexes frames
//! into per-connection read buffers, serializes all outbound writes through
//! one sink lock, and (on the client side) periodically announces its live
//! connection set so the other end can reap orphans.

use crate::connection::{Connection, TunnelStream};
use crate::dialer::{ConnectAuthorizer, LocalDialer};
use crate::error::{TunnelError, TunnelResult};
use crate::localdial;
use crate::message::{Message, MessageType};
use crate::metrics::{NoopMetrics, TunnelMetrics};
use crate::transport::{FrameSink, FrameSource};
use crate::tunables::Tunables;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub struct Session {
    client_key: String,
    session_key: i64,
    /// Client-role sessions are the ones that dialed the physical transport;
    /// they run the periodic connection sync.
    client: bool,
    next_conn_id: AtomicI64,
    next_message_id: AtomicI64,
    conns: RwLock<HashMap<i64, Arc<Connection>>>,
    /// Federation view: which agents are reachable through this session's
    /// peer, as `clientKey -> {sessionKey}`.
    remote_client_keys: RwLock<HashMap<String, HashSet<i64>>>,
    auth: Option<ConnectAuthorizer>,
    dialer: Option<LocalDialer>,
    writer: tokio::sync::Mutex<Box<dyn FrameSink>>,
    cancel: CancellationToken,
    sync_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    closed: AtomicBool,
    tunables: Tunables,
    metrics: Arc<dyn TunnelMetrics>,
}

impl Session {
    /// Session for the side that dialed the transport (agents, peer links).
    pub fn client(
        auth: ConnectAuthorizer,
        sink: Box<dyn FrameSink>,
        dialer: Option<LocalDialer>,
        tunables: Tunables,
        metrics: Option<Arc<dyn TunnelMetrics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_key: "client".to_string(),
            session_key: 0,
            client: true,
            next_conn_id: AtomicI64::new(0),
            next_message_id: AtomicI64::new(0),
            conns: RwLock::new(HashMap::new()),
            remote_client_keys: RwLock::new(HashMap::new()),
            auth: Some(auth),
            dialer,
            writer: tokio::sync::Mutex::new(sink),
            cancel: CancellationToken::new(),
            sync_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            tunables,
            metrics: metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
        })
    }

    /// Session for the side that accepted the transport.
    pub fn server(
        session_key: i64,
        client_key: &str,
        sink: Box<dyn FrameSink>,
        auth: Option<ConnectAuthorizer>,
        dialer: Option<LocalDialer>,
        tunables: Tunables,
        metrics: Option<Arc<dyn TunnelMetrics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_key: client_key.to_string(),
            session_key,
            client: false,
            next_conn_id: AtomicI64::new(1),
            next_message_id: AtomicI64::new(0),
            conns: RwLock::new(HashMap::new()),
            remote_client_keys: RwLock::new(HashMap::new()),
            auth,
            dialer,
            writer: tokio::sync::Mutex::new(sink),
            cancel: CancellationToken::new(),
            sync_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            tunables,
            metrics: metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
        })
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn session_key(&self) -> i64 {
        self.session_key
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn TunnelMetrics> {
        &self.metrics
    }

    pub(crate) fn next_message_id(&self) -> i64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Cancelled when the session shuts down; peer loops and embedders can
    /// watch it to stop driving the transport.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── connection registry ─────────────────────────────────────────────

    fn add_connection(&self, conn_id: i64, conn: Arc<Connection>) {
        let mut conns = self.conns.write().unwrap();
        conns.insert(conn_id, conn);
        trace!(
            session_key = self.session_key,
            connections = conns.len(),
            "connection added"
        );
    }

    pub(crate) fn remove_connection(&self, conn_id: i64) -> Option<Arc<Connection>> {
        let mut conns = self.conns.write().unwrap();
        let conn = conns.remove(&conn_id);
        trace!(
            session_key = self.session_key,
            connections = conns.len(),
            "connection removed"
        );
        conn
    }

    fn get_connection(&self, conn_id: i64) -> Option<Arc<Connection>> {
        self.conns.read().unwrap().get(&conn_id).cloned()
    }

    /// Ordered ids of the currently open connections.
    pub fn active_connection_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.conns.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    // ── federation bookkeeping ──────────────────────────────────────────

    fn add_session_key(&self, client_key: &str, session_key: i64) {
        self.remote_client_keys
            .write()
            .unwrap()
            .entry(client_key.to_string())
            .or_default()
            .insert(session_key);
    }

    fn remove_session_key(&self, client_key: &str, session_key: i64) {
        let mut keys = self.remote_client_keys.write().unwrap();
        if let Some(set) = keys.get_mut(client_key) {
            set.remove(&session_key);
            if set.is_empty() {
                keys.remove(client_key);
            }
        }
    }

    /// Whether the peer behind this session can reach `client_key`.
    pub fn has_remote_client(&self, client_key: &str) -> bool {
        self.remote_client_keys
            .read()
            .unwrap()
            .get(client_key)
            .is_some_and(|s| !s.is_empty())
    }

    // ── serving ─────────────────────────────────────────────────────────

    /// Drive the read loop until the transport ends, a fatal protocol error
    /// occurs, or the session is cancelled.
    pub async fn serve(self: &Arc<Self>, mut source: Box<dyn FrameSource>) -> TunnelResult<()> {
        if self.client {
            self.start_periodic_sync();
        }

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = source.next() => frame?,
            };
            let Some(data) = frame else {
                return Ok(());
            };
            self.serve_frame(data).await?;
        }
    }

    async fn serve_frame(self: &Arc<Self>, data: Bytes) -> TunnelResult<()> {
        let Some(msg) = Message::decode(&data)? else {
            trace!("skipping frame with unknown message type");
            return Ok(());
        };
        trace!(session_key = self.session_key, "REQUEST {msg}");

        match msg.message_type {
            MessageType::Connect => self.client_connect(msg).await,
            MessageType::Data => {
                self.connection_data(msg).await;
                Ok(())
            }
            MessageType::Pause => {
                if let Some(conn) = self.get_connection(msg.conn_id) {
                    conn.on_pause();
                }
                Ok(())
            }
            MessageType::Resume => {
                if let Some(conn) = self.get_connection(msg.conn_id) {
                    conn.on_resume();
                }
                Ok(())
            }
            MessageType::Error => {
                self.on_error(msg);
                Ok(())
            }
            MessageType::AddClient => {
                let (client_key, session_key) = msg.client_address()?;
                self.add_session_key(&client_key, session_key);
                debug!(%client_key, session_key, "remote client added");
                Ok(())
            }
            MessageType::RemoveClient => {
                let (client_key, session_key) = msg.client_address()?;
                self.remove_session_key(&client_key, session_key);
                debug!(%client_key, session_key, "remote client removed");
                Ok(())
            }
            MessageType::SyncConnections => self.on_sync_connections(&msg.body),
        }
    }

    /// Inbound CONNECT: admission-check the target, register the stream,
    /// and dial out in a background task.
    async fn client_connect(self: &Arc<Self>, msg: Message) -> TunnelResult<()> {
        let (proto, address) = msg.connect_target()?;

        let allowed = self
            .auth
            .as_ref()
            .is_some_and(|auth| auth(&proto, &address));
        if !allowed {
            debug!(%proto, %address, "connect not allowed");
            let reply = Message::error(
                self.next_message_id(),
                msg.conn_id,
                Some(&TunnelError::ConnectNotAllowed),
            );
            let deadline = Instant::now() + self.tunables.send_error_timeout;
            let _ = self.write_message(Some(deadline), reply).await;
            return Ok(());
        }

        let conn = Connection::new(msg.conn_id, self, &proto, &address);
        self.add_connection(msg.conn_id, conn.clone());

        let stream = TunnelStream::new(conn);
        let dialer = self.dialer.clone();
        let dial_timeout = self.tunables.dial_timeout;
        tokio::spawn(async move {
            localdial::client_dial(dialer, stream, proto, address, dial_timeout).await;
        });

        Ok(())
    }

    /// Inbound DATA: hand the body to the stream's read buffer, or report
    /// an unknown connection back to the peer.
    async fn connection_data(&self, msg: Message) {
        let Some(conn) = self.get_connection(msg.conn_id) else {
            trace!(conn_id = msg.conn_id, "data for unknown connection");
            let err = TunnelError::Other(format!(
                "connection not found {}/{}/{}",
                self.client_key, self.session_key, msg.conn_id
            ));
            let reply = Message::error(self.next_message_id(), msg.conn_id, Some(&err));
            let deadline = Instant::now() + self.tunables.dial_timeout;
            let _ = self.write_message(Some(deadline), reply).await;
            return;
        };
        conn.on_data(msg.body).await;
    }

    /// Inbound ERROR: close the stream (or, for conn id 0, every stream)
    /// with the reported error. No ERROR is echoed back; the peer has
    /// already forgotten the connection.
    fn on_error(&self, msg: Message) {
        let err = msg.remote_err();
        if msg.conn_id == 0 {
            warn!(session_key = self.session_key, "session-wide error from peer");
            let conns: Vec<Arc<Connection>> = {
                let mut map = self.conns.write().unwrap();
                map.drain().map(|(_, c)| c).collect()
            };
            for conn in conns {
                conn.do_tunnel_close(err.clone());
            }
            return;
        }
        if let Some(conn) = self.remove_connection(msg.conn_id) {
            conn.do_tunnel_close(err);
        }
    }

    // ── outbound ────────────────────────────────────────────────────────

    /// Emit one frame. All writers funnel through the sink lock, so frames
    /// from concurrent streams never interleave on the transport.
    pub(crate) async fn write_message(
        &self,
        deadline: Option<Instant>,
        msg: Message,
    ) -> TunnelResult<()> {
        trace!(session_key = self.session_key, "WRITE {msg}");
        let frame = msg.encode();
        let send = async {
            let mut sink = self.writer.lock().await;
            sink.send(frame).await
        };
        match deadline {
            Some(d) => tokio::time::timeout_at(d, send)
                .await
                .map_err(|_| TunnelError::Timeout)?,
            None => send.await,
        }
    }

    /// Open a stream to `(proto, address)` on the far side of this session.
    ///
    /// Returns as soon as the CONNECT frame is written; a refused or failed
    /// dial surfaces as the stream's terminal error on first read.
    pub async fn dial(self: &Arc<Self>, proto: &str, address: &str) -> TunnelResult<TunnelStream> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Connection::new(conn_id, self, proto, address);
        self.add_connection(conn_id, conn.clone());

        let deadline = Instant::now() + self.tunables.dial_timeout;
        let msg = Message::connect(self.next_message_id(), conn_id, proto, address);
        if let Err(e) = self.write_message(Some(deadline), msg).await {
            self.remove_connection(conn_id);
            conn.do_tunnel_close(Some(e.clone()));
            return Err(e);
        }

        Ok(TunnelStream::new(conn))
    }

    /// Deregister a stream and tell the peer it is gone. `err == None`
    /// reports a clean EOF.
    pub(crate) async fn close_connection(&self, conn_id: i64, err: Option<TunnelError>) {
        if let Some(conn) = self.remove_connection(conn_id) {
            conn.tunnel_close(err).await;
        }
    }

    /// Tear down every stream with a tunnel-disconnect error and stop the
    /// sync task. Idempotent. The transport itself is closed by whoever
    /// owns it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_periodic_sync().await;
        self.cancel.cancel();

        let conns: Vec<Arc<Connection>> = {
            let mut map = self.conns.write().unwrap();
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.tunnel_close(Some(TunnelError::TunnelDisconnect)).await;
        }
    }

    // ── manager listener role (peer links) ──────────────────────────────

    /// Announce a local session to the peer behind this session.
    pub async fn session_added(&self, client_key: &str, session_key: i64) {
        let msg = Message::add_client(self.next_message_id(), client_key, session_key);
        if let Err(e) = self.write_message(None, msg).await {
            warn!(client_key, error = %e, "failed to announce client to peer");
            self.cancel.cancel();
        }
    }

    /// Retract a local session announcement.
    pub async fn session_removed(&self, client_key: &str, session_key: i64) {
        let msg = Message::remove_client(self.next_message_id(), client_key, session_key);
        if let Err(e) = self.write_message(None, msg).await {
            warn!(client_key, error = %e, "failed to retract client from peer");
            self.cancel.cancel();
        }
    }

    // ── periodic sync plumbing (bodies live in sync.rs) ────────────────

    fn start_periodic_sync(self: &Arc<Self>) {
        let token = self.cancel.child_token();
        let session = Arc::clone(self);
        let period = self.tunables.sync_connections_interval;
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = session.send_sync_connections().await {
                            warn!(error = %e, "error syncing connections");
                        }
                    }
                }
            }
        });
        *self.sync_task.lock().unwrap() = Some((token, handle));
    }

    async fn stop_periodic_sync(&self) {
        let task = self.sync_task.lock().unwrap().take();
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_key", &self.client_key)
            .field("session_key", &self.session_key)
            .field("client", &self.client)
            .field("connections", &self.connection_count())
            .finish()
    }
}
