//! revtun-client: the agent side of the revtun reverse tunnel.
//!
//! An agent dials out to the server over WebSocket, presents its identity
//! headers, and then serves the multiplexed session: every inbound CONNECT
//! is checked against the agent's authorizer and dialed locally. The server
//! can from then on reach anything the agent can.

use http::HeaderMap;
use revtun_core::{
    websocket_transport, ConnectAuthorizer, LocalDialer, Session, TunnelError, TunnelResult,
    Tunables,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Callback invoked with the live session once the tunnel is established.
/// Returning an error tears the session down.
pub type OnConnect = Arc<
    dyn Fn(Arc<Session>) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send>> + Send + Sync,
>;

/// Everything needed to run an agent against one server.
#[derive(Clone)]
pub struct ClientOptions {
    /// `ws://` or `wss://` URL of the server's tunnel endpoint.
    pub url: String,
    /// Extra headers for the upgrade request (identity, credentials).
    pub headers: HeaderMap,
    /// Admission predicate for CONNECT targets arriving from the server.
    pub auth: ConnectAuthorizer,
    /// Dialer for admitted targets; plain TCP when `None`.
    pub dialer: Option<LocalDialer>,
    /// Invoked once the session is serving.
    pub on_connect: Option<OnConnect>,
    pub tunables: Tunables,
}

impl ClientOptions {
    pub fn new(url: &str, auth: ConnectAuthorizer) -> Self {
        Self {
            url: url.to_string(),
            headers: HeaderMap::new(),
            auth,
            dialer: None,
            on_connect: None,
            tunables: Tunables::default(),
        }
    }
}

/// Connect once and serve the session until the transport ends, the
/// session fails, or `cancel` fires.
pub async fn connect_to_proxy(opts: &ClientOptions, cancel: &CancellationToken) -> TunnelResult<()> {
    info!(url = %opts.url, "connecting to proxy");

    let mut request = opts
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::Transport(format!("proxy url: {e}")))?;
    for (name, value) in &opts.headers {
        request.headers_mut().insert(name, value.clone());
    }

    let (ws, _resp) = tokio::time::timeout(opts.tunables.handshake_timeout, connect_async(request))
        .await
        .map_err(|_| TunnelError::Timeout)?
        .map_err(|e| TunnelError::Transport(format!("proxy dial: {e}")))?;

    info!(url = %opts.url, "connected to proxy");

    let (sink, source) = websocket_transport(ws);
    let session = Session::client(
        opts.auth.clone(),
        sink,
        opts.dialer.clone(),
        opts.tunables.clone(),
        None,
    );

    let (err_tx, err_rx) = tokio::sync::oneshot::channel::<TunnelError>();
    if let Some(on_connect) = &opts.on_connect {
        let on_connect = on_connect.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = on_connect(session).await {
                let _ = err_tx.send(e);
            }
        });
    }
    // A dropped-without-send channel (callback succeeded or absent) must
    // not end the session.
    let on_connect_failed = async {
        match err_rx.await {
            Ok(e) => e,
            Err(_) => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        served = session.serve(source) => served,
        e = on_connect_failed => Err(e),
    };
    session.close().await;
    result
}

/// Reconnect loop: run [`connect_to_proxy`] until `cancel` fires, waiting
/// five seconds after each failure or disconnect.
pub async fn run_client(opts: ClientOptions, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = connect_to_proxy(&opts, &cancel).await {
            warn!(url = %opts.url, error = %e, "proxy connection failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
