//! Timing and sizing knobs, threaded to each session.

use std::time::Duration;

/// Tunnel tuning parameters. The defaults are the protocol's published
/// values; tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Transport upgrade deadline.
    pub handshake_timeout: Duration,
    /// Cadence of the client-side connection-set sync.
    pub sync_connections_interval: Duration,
    /// Write deadline for a sync frame.
    pub sync_connections_timeout: Duration,
    /// Write deadline for terminal ERROR frames.
    pub send_error_timeout: Duration,
    /// Deadline for CONNECT emission and for local dials.
    pub dial_timeout: Duration,
    /// Maximum bytes per read-buffer chunk.
    pub max_read: usize,
    /// Buffered bytes above which the reader PAUSEs the peer.
    pub high_water: usize,
    /// Buffered bytes below which the reader RESUMEs the peer.
    pub low_water: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            sync_connections_interval: Duration::from_secs(60),
            sync_connections_timeout: Duration::from_secs(60),
            send_error_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(60),
            max_read: 8192,
            high_water: 1 << 20,
            low_water: 1 << 18,
        }
    }
}
