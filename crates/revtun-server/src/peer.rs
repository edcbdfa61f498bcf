//! Outbound sessions to sibling servers.
//!
//! Each registered peer gets a driving task: dial its URL with our peer
//! credentials, run a client-role session whose dialer routes
//! `clientKey::proto` CONNECTs back through the local session manager,
//! and mirror the local session set to it. Any failure tears the link down
//! and the loop retries after five seconds until cancelled.

use crate::server::Server;
use revtun_core::{
    websocket_transport, ConnectAuthorizer, DialedConn, LocalDialer, Session, TunnelError,
    TunnelResult, HEADER_TUNNEL_ID, HEADER_TUNNEL_TOKEN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(5);

pub(crate) async fn run(server: Arc<Server>, url: String, id: String, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(metrics) = server.metrics() {
            metrics.peer_connect_attempt(&id);
        }

        match connect_once(&server, &url, &id, &cancel).await {
            Ok(()) => info!(%id, "peer session ended"),
            Err(e) => warn!(%url, %id, error = %e, "failed to serve peer connection"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }
}

async fn connect_once(
    server: &Arc<Server>,
    url: &str,
    id: &str,
    cancel: &CancellationToken,
) -> TunnelResult<()> {
    let Some((peer_id, peer_token)) = server.peer_credentials() else {
        return Err(TunnelError::Other("peer credentials not configured".to_string()));
    };

    let mut request = url
        .into_client_request()
        .map_err(|e| TunnelError::Transport(format!("peer url: {e}")))?;
    let headers = request.headers_mut();
    headers.insert(
        HEADER_TUNNEL_ID,
        peer_id
            .parse()
            .map_err(|_| TunnelError::Other("invalid peer id header".to_string()))?,
    );
    headers.insert(
        HEADER_TUNNEL_TOKEN,
        peer_token
            .parse()
            .map_err(|_| TunnelError::Other("invalid peer token header".to_string()))?,
    );

    let (ws, _resp) = tokio::time::timeout(server.tunables().handshake_timeout, connect_async(request))
        .await
        .map_err(|_| TunnelError::Timeout)?
        .map_err(|e| TunnelError::Transport(format!("peer dial: {e}")))?;

    if let Some(metrics) = server.metrics() {
        metrics.peer_connected(id);
    }
    info!(url, id, "connected to peer");

    // The peer is trusted with any CONNECT; its targets are re-authorized
    // by the session that finally dials them.
    let allow_all: ConnectAuthorizer = Arc::new(|_, _| true);
    let (sink, source) = websocket_transport(ws);
    let session = Session::client(
        allow_all,
        sink,
        Some(federation_dialer(server.clone())),
        server.tunables().clone(),
        server.metrics().cloned(),
    );

    let listener_token = server.session_manager().add_listener(session.clone()).await;
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        served = session.serve(source) => served,
    };
    server.session_manager().remove_listener(listener_token);
    session.close().await;
    result
}

/// Resolves `clientKey::proto` CONNECTs from a peer into a stream through
/// the local session manager.
fn federation_dialer(server: Arc<Server>) -> LocalDialer {
    Arc::new(move |proto: String, address: String| {
        let server = server.clone();
        Box::pin(async move {
            let Some((client_key, real_proto)) = proto.split_once("::") else {
                return Err(TunnelError::Other(format!("invalid clientKey/proto: {proto}")));
            };
            let dialer = server.dialer(client_key)?;
            let stream = dialer(real_proto.to_string(), address).await?;
            Ok(DialedConn::Tunnel(stream))
        })
    })
}
