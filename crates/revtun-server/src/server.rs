//! The server front: accepts agent and peer WebSocket connections, keys
//! them by client key, and resolves dialers for server-side users.
//!
//! Authentication of the upgrade request is a seam: requests presenting
//! peer credentials (`X-Tunnel-ID` + `X-API-Tunnel-Token` matching a
//! registered peer) are accepted as peers; everything else goes through the
//! embedder-supplied [`Authorizer`]. Embedders with their own HTTP stack
//! can skip [`Server::listen`] entirely and hand upgraded WebSockets to
//! [`Server::serve_session`].

use crate::peer;
use crate::session_manager::SessionManager;
use revtun_core::{
    websocket_transport, ConnectAuthorizer, Dialer, Session, TunnelError, TunnelMetrics,
    TunnelResult, Tunables, HEADER_TUNNEL_ID, HEADER_TUNNEL_TOKEN,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Authorizes an upgrade request, returning the client key it belongs to.
/// `Ok(None)` means unauthenticated.
pub type Authorizer = Arc<dyn Fn(&Request) -> TunnelResult<Option<String>> + Send + Sync>;

pub(crate) struct PeerEntry {
    pub url: String,
    pub token: String,
    pub cancel: CancellationToken,
}

pub struct Server {
    peer_id: Option<String>,
    peer_token: Option<String>,
    client_auth: Option<ConnectAuthorizer>,
    authorizer: Authorizer,
    sessions: SessionManager,
    peers: Mutex<HashMap<String, PeerEntry>>,
    tunables: Tunables,
    metrics: Option<Arc<dyn TunnelMetrics>>,
}

impl Server {
    pub fn new(authorizer: Authorizer) -> Self {
        Self::with_tunables(authorizer, Tunables::default())
    }

    pub fn with_tunables(authorizer: Authorizer, tunables: Tunables) -> Self {
        Self {
            peer_id: None,
            peer_token: None,
            client_auth: None,
            authorizer,
            sessions: SessionManager::new(tunables.clone(), None),
            peers: Mutex::new(HashMap::new()),
            tunables,
            metrics: None,
        }
    }

    /// Identity this server presents when dialing sibling servers. Peering
    /// is disabled until both are set.
    pub fn with_peer_credentials(mut self, id: &str, token: &str) -> Self {
        self.peer_id = Some(id.to_string());
        self.peer_token = Some(token.to_string());
        self
    }

    /// Admission predicate handed to every session for inbound CONNECTs.
    pub fn with_client_connect_authorizer(mut self, auth: ConnectAuthorizer) -> Self {
        self.client_auth = Some(auth);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn TunnelMetrics>) -> Self {
        self.sessions = SessionManager::new(self.tunables.clone(), Some(metrics.clone()));
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<dyn TunnelMetrics>> {
        self.metrics.as_ref()
    }

    pub(crate) fn peer_credentials(&self) -> Option<(String, String)> {
        Some((self.peer_id.clone()?, self.peer_token.clone()?))
    }

    pub(crate) fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    /// A dialer that opens streams through `client_key`'s session, directly
    /// or via a peer that advertises it.
    pub fn dialer(&self, client_key: &str) -> TunnelResult<Dialer> {
        self.sessions.get_dialer(client_key)
    }

    /// Whether an agent with this key is connected directly to this server.
    pub fn has_session(&self, client_key: &str) -> bool {
        self.sessions.has_session(client_key)
    }

    // ── peer federation ─────────────────────────────────────────────────

    /// Register (or update) a sibling server and keep an outbound session
    /// to it. Re-registering identical parameters is a no-op; changed
    /// parameters replace the running loop.
    pub fn add_peer(self: &Arc<Self>, url: &str, id: &str, token: &str) {
        if self.peer_id.is_none() || self.peer_token.is_none() {
            return;
        }

        let mut peers = self.peers.lock().unwrap();
        if let Some(existing) = peers.get(id) {
            if existing.url == url && existing.token == token {
                return;
            }
            existing.cancel.cancel();
        }

        info!(url, id, "adding peer");
        let cancel = CancellationToken::new();
        peers.insert(
            id.to_string(),
            PeerEntry {
                url: url.to_string(),
                token: token.to_string(),
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(peer::run(
            self.clone(),
            url.to_string(),
            id.to_string(),
            cancel,
        ));
    }

    /// Stop and forget a peer.
    pub fn remove_peer(&self, id: &str) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(entry) = peers.remove(id) {
            info!(id, "removing peer");
            entry.cancel.cancel();
        }
    }

    fn peer_token_for(&self, id: &str) -> Option<String> {
        self.peers.lock().unwrap().get(id).map(|p| p.token.clone())
    }

    // ── accepting connections ───────────────────────────────────────────

    /// Accept loop over a bound listener. Each connection is upgraded,
    /// authorized, and served on its own task until `cancel` fires.
    pub async fn listen(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> TunnelResult<()> {
        info!(addr = %listener.local_addr()?, "tunnel listener started");
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.accept_connection(stream).await {
                    warn!(remote = %remote, error = %e, "connection ended");
                }
            });
        }
    }

    /// Upgrade one raw TCP connection, authorize it from the handshake
    /// headers, and serve the resulting session to completion.
    pub async fn accept_connection(self: &Arc<Self>, stream: TcpStream) -> TunnelResult<()> {
        let identity: Arc<Mutex<Option<(String, bool)>>> = Arc::new(Mutex::new(None));

        let ws = {
            let server = self.clone();
            let identity = identity.clone();
            let callback = move |req: &Request, resp: Response| match server.authorize(req) {
                Ok(outcome) => {
                    *identity.lock().unwrap() = Some(outcome);
                    Ok(resp)
                }
                Err(e) => {
                    let mut denied = ErrorResponse::new(Some(e.to_string()));
                    *denied.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(denied)
                }
            };
            tokio::time::timeout(
                self.tunables.handshake_timeout,
                tokio_tungstenite::accept_hdr_async(stream, callback),
            )
            .await
            .map_err(|_| TunnelError::Timeout)?
            .map_err(|e| TunnelError::Transport(format!("websocket upgrade: {e}")))?
        };

        let (client_key, is_peer) = identity
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TunnelError::Other("upgrade finished without identity".to_string()))?;

        self.serve_session(ws, &client_key, is_peer).await
    }

    /// Serve an already-upgraded WebSocket as a session. This is the entry
    /// point for embedders that run their own HTTP upgrade.
    pub async fn serve_session<S>(
        self: &Arc<Self>,
        ws: WebSocketStream<S>,
        client_key: &str,
        is_peer: bool,
    ) -> TunnelResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = websocket_transport(ws);
        let session: Arc<Session> = self
            .sessions
            .add(client_key, sink, is_peer, self.client_auth.clone(), None)
            .await;
        info!(client_key, peer = is_peer, "handling backend connection");

        let result = session.serve(source).await;
        self.sessions.remove(&session).await;
        if let Err(e) = &result {
            warn!(client_key, error = %e, "session ended with error");
        }
        result
    }

    /// Peer credentials win over the embedder authorizer, mirroring the
    /// upgrade-header contract: `X-Tunnel-ID` + `X-API-Tunnel-Token`
    /// matching a registered peer authenticates as that peer.
    fn authorize(&self, req: &Request) -> TunnelResult<(String, bool)> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        if let (Some(id), Some(token)) = (header(HEADER_TUNNEL_ID), header(HEADER_TUNNEL_TOKEN)) {
            if self.peer_token_for(&id).is_some_and(|t| t == token) {
                return Ok((id, true));
            }
        }

        match (self.authorizer)(req)? {
            Some(client_key) => Ok((client_key, false)),
            None => Err(TunnelError::Other("failed authentication".to_string())),
        }
    }
}
