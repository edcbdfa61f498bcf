//! Registry of live sessions, split into direct clients and peer links.
//!
//! Listeners (the outbound peer sessions) are told about every session add
//! and remove so sibling servers learn which agents are reachable here; a
//! freshly added listener gets a replay of the current set.

use rand::Rng;
use revtun_core::{
    ConnectAuthorizer, Dialer, FrameSink, LocalDialer, Session, TunnelError, TunnelMetrics,
    TunnelResult, TunnelStream, Tunables,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
struct State {
    clients: HashMap<String, Vec<Arc<Session>>>,
    peers: HashMap<String, Vec<Arc<Session>>>,
    listeners: HashMap<u64, Arc<Session>>,
    next_listener_id: u64,
}

pub struct SessionManager {
    state: Mutex<State>,
    tunables: Tunables,
    metrics: Option<Arc<dyn TunnelMetrics>>,
}

impl SessionManager {
    pub fn new(tunables: Tunables, metrics: Option<Arc<dyn TunnelMetrics>>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            tunables,
            metrics,
        }
    }

    /// Register a freshly accepted transport as a session and announce it
    /// to every listener.
    pub async fn add(
        &self,
        client_key: &str,
        sink: Box<dyn FrameSink>,
        peer: bool,
        auth: Option<ConnectAuthorizer>,
        dialer: Option<LocalDialer>,
    ) -> Arc<Session> {
        let session_key = random_session_key();
        let session = Session::server(
            session_key,
            client_key,
            sink,
            auth,
            dialer,
            self.tunables.clone(),
            self.metrics.clone(),
        );

        let listeners: Vec<Arc<Session>> = {
            let mut state = self.state.lock().unwrap();
            let table = if peer {
                &mut state.peers
            } else {
                &mut state.clients
            };
            table
                .entry(client_key.to_string())
                .or_default()
                .push(session.clone());
            state.listeners.values().cloned().collect()
        };
        if let Some(metrics) = &self.metrics {
            metrics.session_added(client_key, peer);
        }
        debug!(client_key, peer, session_key, "session registered");

        for listener in listeners {
            listener.session_added(client_key, session_key).await;
        }
        session
    }

    /// Drop a session from whichever table holds it, tell the listeners,
    /// and close it. Idempotent.
    pub async fn remove(&self, session: &Arc<Session>) {
        let client_key = session.client_key().to_string();
        let session_key = session.session_key();

        let (found_peer, listeners) = {
            let mut state = self.state.lock().unwrap();
            let mut found_peer = None;
            {
                let table = &mut state.clients;
                let is_peer = false;
                if let Some(sessions) = table.get_mut(&client_key) {
                    let before = sessions.len();
                    sessions.retain(|s| s.session_key() != session_key);
                    if sessions.len() != before {
                        found_peer = Some(is_peer);
                    }
                    if sessions.is_empty() {
                        table.remove(&client_key);
                    }
                }
            }
            {
                let table = &mut state.peers;
                let is_peer = true;
                if let Some(sessions) = table.get_mut(&client_key) {
                    let before = sessions.len();
                    sessions.retain(|s| s.session_key() != session_key);
                    if sessions.len() != before {
                        found_peer = Some(is_peer);
                    }
                    if sessions.is_empty() {
                        table.remove(&client_key);
                    }
                }
            }
            (found_peer, state.listeners.values().cloned().collect::<Vec<_>>())
        };

        if let Some(peer) = found_peer {
            if let Some(metrics) = &self.metrics {
                metrics.session_removed(&client_key, peer);
            }
            debug!(%client_key, peer, session_key, "session deregistered");
            for listener in listeners {
                listener.session_removed(&client_key, session_key).await;
            }
        }
        session.close().await;
    }

    /// Resolve a dialer for `client_key`: a direct session wins; otherwise
    /// any peer that advertises the key routes with a `clientKey::` proto
    /// prefix.
    pub fn get_dialer(&self, client_key: &str) -> TunnelResult<Dialer> {
        let state = self.state.lock().unwrap();

        if let Some(session) = state.clients.get(client_key).and_then(|s| s.first()) {
            return Ok(to_dialer(session.clone(), None));
        }

        for sessions in state.peers.values() {
            for session in sessions {
                if session.has_remote_client(client_key) {
                    return Ok(to_dialer(session.clone(), Some(client_key.to_string())));
                }
            }
        }

        Err(TunnelError::Other(format!(
            "failed to find session for client {client_key}"
        )))
    }

    /// Whether a direct session exists for `client_key`.
    pub fn has_session(&self, client_key: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .clients
            .get(client_key)
            .is_some_and(|s| !s.is_empty())
    }

    /// Subscribe a listener and replay the current session set so it builds
    /// a complete view. Returns a token for [`SessionManager::remove_listener`].
    pub async fn add_listener(&self, listener: Arc<Session>) -> u64 {
        let (token, existing) = {
            let mut state = self.state.lock().unwrap();
            let token = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners.insert(token, listener.clone());

            let mut existing: Vec<(String, i64)> = Vec::new();
            for table in [&state.clients, &state.peers] {
                for (key, sessions) in table {
                    for session in sessions {
                        existing.push((key.clone(), session.session_key()));
                    }
                }
            }
            (token, existing)
        };

        for (client_key, session_key) in existing {
            listener.session_added(&client_key, session_key).await;
        }
        token
    }

    pub fn remove_listener(&self, token: u64) {
        self.state.lock().unwrap().listeners.remove(&token);
    }
}

fn to_dialer(session: Arc<Session>, prefix: Option<String>) -> Dialer {
    Arc::new(move |proto: String, address: String| {
        let session = session.clone();
        let proto = match &prefix {
            Some(p) => format!("{p}::{proto}"),
            None => proto,
        };
        Box::pin(async move {
            let stream: TunnelStream = session.dial(&proto, &address).await?;
            Ok(stream)
        })
    })
}

fn random_session_key() -> i64 {
    // 63-bit, keeps the key positive.
    (rand::thread_rng().gen::<u64>() >> 1) as i64
}
