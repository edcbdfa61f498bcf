//! CLI configuration: TOML file + command-line overrides.

use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Listen address for the tunnel endpoint.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shared secret agents must present in `X-API-Tunnel-Secret`.
    /// Empty disables the check (any `X-Tunnel-ID` is accepted).
    #[serde(default)]
    pub agent_secret: String,
    /// This server's peer identity; empty disables peering.
    #[serde(default)]
    pub peer_id: String,
    /// Token this server presents when dialing peers.
    #[serde(default)]
    pub peer_token: String,
    /// Sibling servers to federate with.
    #[serde(default)]
    pub peers: Vec<PeerSection>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            agent_secret: String::new(),
            peer_id: String::new(),
            peer_token: String::new(),
            peers: Vec::new(),
        }
    }
}

/// One `[[server.peers]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerSection {
    pub id: String,
    pub url: String,
    pub token: String,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Server tunnel endpoint URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Identity presented in `X-Tunnel-ID`.
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// Credential presented in `X-API-Tunnel-Secret`.
    #[serde(default)]
    pub secret: String,
    /// Destinations the server may dial through this agent. Exact
    /// `host:port`, bare `host` (any port), or `*` for everything.
    #[serde(default = "default_allowed")]
    pub allowed_destinations: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            id: default_agent_id(),
            secret: String::new(),
            allowed_destinations: default_allowed(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8123".to_string()
}
fn default_url() -> String {
    "ws://127.0.0.1:8123/connect".to_string()
}
fn default_agent_id() -> String {
    "agent".to_string()
}
fn default_allowed() -> Vec<String> {
    vec!["*".to_string()]
}

impl ConfigFile {
    /// Load from a TOML file; missing file means defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Whether `address` matches the agent's destination allowlist.
pub fn destination_allowed(allowed: &[String], address: &str) -> bool {
    let host = address.rsplit_once(':').map_or(address, |(h, _)| h);
    allowed
        .iter()
        .any(|a| a == "*" || a == address || a == host)
}
