//! revtun-server: the hub side of the revtun reverse tunnel.
//!
//! Accepts agent and peer WebSocket connections, keeps the session
//! registry, resolves dialers for server-side users, and federates streams
//! across sibling servers.

mod peer;
mod server;
mod session_manager;

pub use server::{Authorizer, Server};
pub use session_manager::SessionManager;

/// The HTTP upgrade request an [`Authorizer`] inspects.
pub use tokio_tungstenite::tungstenite::handshake::server::Request as UpgradeRequest;
