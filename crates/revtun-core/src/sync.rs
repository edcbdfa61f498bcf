//! Connection-set reconciliation.
//!
//! Client-role sessions periodically send the ids of their open streams.
//! The receiving side closes anything it still tracks that the sender has
//! forgotten, using a sentinel error that never goes back on the wire.

use crate::connection::Connection;
use crate::error::{TunnelError, TunnelResult};
use crate::message::Message;
use crate::session::Session;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Serialize connection ids as little-endian u64s.
pub fn encode_connection_ids(ids: &[i64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 * ids.len());
    for id in ids {
        buf.put_u64_le(*id as u64);
    }
    buf.freeze()
}

/// Inverse of [`encode_connection_ids`]. The payload length must be a
/// multiple of 8.
pub fn decode_connection_ids(payload: &[u8]) -> TunnelResult<Vec<i64>> {
    if payload.len() % 8 != 0 {
        return Err(TunnelError::Framing(
            "sync connections payload is not a multiple of 8 bytes".to_string(),
        ));
    }
    let mut ids = Vec::with_capacity(payload.len() / 8);
    for chunk in payload.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        ids.push(u64::from_le_bytes(raw) as i64);
    }
    Ok(ids)
}

impl Session {
    /// Send the current active connection-id set to the peer.
    pub async fn send_sync_connections(&self) -> TunnelResult<()> {
        let ids = self.active_connection_ids();
        let msg = Message::sync_connections(self.next_message_id(), encode_connection_ids(&ids));
        let deadline = Instant::now() + self.tunables().sync_connections_timeout;
        self.write_message(Some(deadline), msg).await
    }

    /// Apply a received sync frame: close every local stream whose id is
    /// absent from the sender's set. No ERROR frames go back: the sender
    /// has already forgotten these streams.
    pub(crate) fn on_sync_connections(&self, payload: &[u8]) -> TunnelResult<()> {
        let active = decode_connection_ids(payload)?;
        let active: HashSet<i64> = active.into_iter().collect();

        let stale: Vec<Arc<Connection>> = {
            let ids: Vec<i64> = self
                .active_connection_ids()
                .into_iter()
                .filter(|id| !active.contains(id))
                .collect();
            ids.into_iter()
                .filter_map(|id| self.remove_connection(id))
                .collect()
        };

        if !stale.is_empty() {
            debug!(reclaimed = stale.len(), "sync closed stale connections");
        }
        for conn in stale {
            conn.do_tunnel_close(Some(TunnelError::SyncReclaimed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_round_trip() {
        for ids in [
            vec![],
            vec![1],
            vec![1, 2, 3],
            vec![i64::MAX, 0, 42],
        ] {
            let encoded = encode_connection_ids(&ids);
            assert_eq!(encoded.len(), 8 * ids.len());
            assert_eq!(decode_connection_ids(&encoded).unwrap(), ids);
        }
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let encoded = encode_connection_ids(&[1, 2]);
        assert!(matches!(
            decode_connection_ids(&encoded[..encoded.len() - 3]),
            Err(TunnelError::Framing(_))
        ));
    }
}
