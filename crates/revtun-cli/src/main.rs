//! revtun: reverse tunnel server and agent.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{destination_allowed, ConfigFile};
use revtun_core::{ConnectAuthorizer, HEADER_TUNNEL_ID, HEADER_TUNNEL_SECRET};
use revtun_server::{Authorizer, Server, UpgradeRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Dial endpoints behind NAT through persistent agent tunnels
#[derive(Parser, Debug)]
#[command(name = "revtun", version, about)]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tunnel server
    Server {
        /// Listen address override
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run an agent that exposes local endpoints to the server
    Agent {
        /// Server URL override
        #[arg(short, long)]
        url: Option<String>,

        /// Agent identity override
        #[arg(long)]
        id: Option<String>,

        /// Agent secret override
        #[arg(long, env = "REVTUN_AGENT_SECRET")]
        secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = ConfigFile::load(cli.config.as_deref())?;
    let cancel = CancellationToken::new();
    spawn_shutdown_watcher(cancel.clone());

    match cli.command {
        Command::Server { listen } => run_server(config, listen, cancel).await,
        Command::Agent { url, id, secret } => run_agent(config, url, id, secret, cancel).await,
    }
}

async fn run_server(
    config: ConfigFile,
    listen_override: Option<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let section = config.server;
    let listen = listen_override.unwrap_or(section.listen);

    // Agents authenticate with an id header and, if configured, the shared
    // secret. Peer credentials are checked by the server itself.
    let secret = section.agent_secret.clone();
    let authorizer: Authorizer = Arc::new(move |req: &UpgradeRequest| {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        if !secret.is_empty() && header(HEADER_TUNNEL_SECRET).as_deref() != Some(secret.as_str()) {
            return Ok(None);
        }
        Ok(header(HEADER_TUNNEL_ID))
    });

    let mut server = Server::new(authorizer)
        .with_client_connect_authorizer(Arc::new(|_proto, _address| true));
    if !section.peer_id.is_empty() && !section.peer_token.is_empty() {
        server = server.with_peer_credentials(&section.peer_id, &section.peer_token);
    }
    let server = Arc::new(server);

    for peer in &section.peers {
        server.add_peer(&peer.url, &peer.id, &peer.token);
    }

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("cannot bind {listen}"))?;
    info!(version = env!("CARGO_PKG_VERSION"), %listen, "starting revtun server");

    server.listen(listener, cancel).await?;
    info!("revtun server stopped");
    Ok(())
}

async fn run_agent(
    config: ConfigFile,
    url_override: Option<String>,
    id_override: Option<String>,
    secret_override: Option<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let section = config.agent;
    let url = url_override.unwrap_or(section.url);
    let id = id_override.unwrap_or(section.id);
    let secret = secret_override.unwrap_or(section.secret);

    let allowed = section.allowed_destinations;
    let auth: ConnectAuthorizer =
        Arc::new(move |_proto, address| destination_allowed(&allowed, address));

    let mut opts = revtun_client::ClientOptions::new(&url, auth);
    opts.headers
        .insert(HEADER_TUNNEL_ID, id.parse().context("invalid agent id")?);
    if !secret.is_empty() {
        opts.headers.insert(
            HEADER_TUNNEL_SECRET,
            secret.parse().context("invalid agent secret")?,
        );
    }

    info!(version = env!("CARGO_PKG_VERSION"), %url, %id, "starting revtun agent");
    revtun_client::run_client(opts, cancel).await;
    info!("revtun agent stopped");
    Ok(())
}

fn spawn_shutdown_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        cancel.cancel();
    });
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
