//! End-to-end tests over real WebSockets on loopback: a server, an agent
//! connected through `revtun-client`, and real TCP endpoints behind the
//! agent.

use revtun_client::ClientOptions;
use revtun_core::{ConnectAuthorizer, TunnelError, HEADER_TUNNEL_ID};
use revtun_server::{Authorizer, Server, UpgradeRequest};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Authorizer that trusts the `X-Tunnel-ID` header.
fn header_authorizer() -> Authorizer {
    Arc::new(|req: &UpgradeRequest| {
        Ok(req
            .headers()
            .get(HEADER_TUNNEL_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    })
}

/// TCP echo endpoint; returns its bound address.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Bind a tunnel server on loopback and start its accept loop.
async fn start_tunnel_server(server: Arc<Server>, cancel: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.listen(listener, cancel).await;
    });
    addr
}

fn agent_options(server_addr: SocketAddr, agent_id: &str, auth: ConnectAuthorizer) -> ClientOptions {
    let mut opts = ClientOptions::new(&format!("ws://{server_addr}/connect"), auth);
    opts.headers
        .insert(HEADER_TUNNEL_ID, agent_id.parse().unwrap());
    opts
}

async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, ready: F) {
    let deadline = Instant::now() + timeout;
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn dial_through_agent_round_trips() {
    let cancel = CancellationToken::new();
    let server = Arc::new(
        Server::new(header_authorizer())
            .with_client_connect_authorizer(Arc::new(|_, _| true)),
    );
    let server_addr = start_tunnel_server(server.clone(), cancel.clone()).await;
    let echo_addr = start_echo_server().await;

    let opts = agent_options(server_addr, "agent-1", Arc::new(|_, _| true));
    let agent_cancel = cancel.clone();
    tokio::spawn(async move {
        revtun_client::run_client(opts, agent_cancel).await;
    });

    wait_for("agent session", Duration::from_secs(5), || {
        server.has_session("agent-1")
    })
    .await;

    let dialer = server.dialer("agent-1").unwrap();
    let stream = dialer("tcp".to_string(), echo_addr.to_string())
        .await
        .unwrap();
    stream.write(b"HELLO").await.unwrap();

    let mut buf = [0u8; 5];
    let mut got = 0;
    while got < 5 {
        let n = stream.read(&mut buf[got..]).await.unwrap();
        assert!(n > 0, "stream ended early");
        got += n;
    }
    assert_eq!(&buf, b"HELLO");

    stream.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn agent_denies_disallowed_target() {
    let cancel = CancellationToken::new();
    let server = Arc::new(
        Server::new(header_authorizer())
            .with_client_connect_authorizer(Arc::new(|_, _| true)),
    );
    let server_addr = start_tunnel_server(server.clone(), cancel.clone()).await;

    // The agent refuses everything.
    let opts = agent_options(server_addr, "agent-2", Arc::new(|_, _| false));
    let agent_cancel = cancel.clone();
    tokio::spawn(async move {
        revtun_client::run_client(opts, agent_cancel).await;
    });

    wait_for("agent session", Duration::from_secs(5), || {
        server.has_session("agent-2")
    })
    .await;

    let dialer = server.dialer("agent-2").unwrap();
    let stream = dialer("tcp".to_string(), "127.0.0.1:1".to_string())
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    match stream.read(&mut buf).await {
        Err(TunnelError::Remote(msg)) => {
            assert!(msg.contains("connect not allowed"), "got {msg}")
        }
        other => panic!("unexpected {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn failed_local_dial_reports_error() {
    let cancel = CancellationToken::new();
    let server = Arc::new(
        Server::new(header_authorizer())
            .with_client_connect_authorizer(Arc::new(|_, _| true)),
    );
    let server_addr = start_tunnel_server(server.clone(), cancel.clone()).await;

    let opts = agent_options(server_addr, "agent-3", Arc::new(|_, _| true));
    let agent_cancel = cancel.clone();
    tokio::spawn(async move {
        revtun_client::run_client(opts, agent_cancel).await;
    });

    wait_for("agent session", Duration::from_secs(5), || {
        server.has_session("agent-3")
    })
    .await;

    // Nothing listens on port 1; the dial error must come back as the
    // stream's terminal error.
    let dialer = server.dialer("agent-3").unwrap();
    let stream = dialer("tcp".to_string(), "127.0.0.1:1".to_string())
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    match stream.read(&mut buf).await {
        Err(TunnelError::Remote(_)) => {}
        other => panic!("unexpected {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn unknown_client_key_has_no_dialer() {
    let server = Server::new(header_authorizer());
    assert!(server.dialer("nobody").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_federation_routes_to_remote_agent() {
    let cancel = CancellationToken::new();
    let token = "peer-secret";

    let server_a = Arc::new(
        Server::new(header_authorizer())
            .with_client_connect_authorizer(Arc::new(|_, _| true))
            .with_peer_credentials("a", token),
    );
    let server_b = Arc::new(
        Server::new(header_authorizer())
            .with_client_connect_authorizer(Arc::new(|_, _| true))
            .with_peer_credentials("b", token),
    );

    let addr_a = start_tunnel_server(server_a.clone(), cancel.clone()).await;
    let addr_b = start_tunnel_server(server_b.clone(), cancel.clone()).await;
    let echo_addr = start_echo_server().await;

    // Register credentials on both sides before the loops can cross-dial.
    server_b.add_peer(&format!("ws://{addr_a}/connect"), "a", token);
    server_a.add_peer(&format!("ws://{addr_b}/connect"), "b", token);

    // The agent lives on A; the user dials from B.
    let opts = agent_options(addr_a, "agent-far", Arc::new(|_, _| true));
    let agent_cancel = cancel.clone();
    tokio::spawn(async move {
        revtun_client::run_client(opts, agent_cancel).await;
    });

    wait_for("agent on A", Duration::from_secs(5), || {
        server_a.has_session("agent-far")
    })
    .await;

    // B learns about the agent via ADDCLIENT replay on the peer link; the
    // first peer dial may lose a race with registration, so poll.
    let deadline = Instant::now() + Duration::from_secs(15);
    let dialer = loop {
        match server_b.dialer("agent-far") {
            Ok(d) => break d,
            Err(_) => {
                assert!(Instant::now() < deadline, "peer never advertised agent-far");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };

    let stream = dialer("tcp".to_string(), echo_addr.to_string())
        .await
        .unwrap();
    stream.write(b"ACROSS").await.unwrap();

    let mut buf = [0u8; 6];
    let mut got = 0;
    while got < 6 {
        let n = stream.read(&mut buf[got..]).await.unwrap();
        assert!(n > 0, "stream ended early");
        got += n;
    }
    assert_eq!(&buf, b"ACROSS");

    stream.close().await;
    server_a.remove_peer("b");
    server_b.remove_peer("a");
    cancel.cancel();
}
