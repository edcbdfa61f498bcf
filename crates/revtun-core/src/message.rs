//! Wire framing for tunnel messages.
//!
//! One transport message carries exactly one frame:
//!
//! ```text
//! varint id          -- per-sender sequence, tracing only
//! varint connID      -- logical stream id, 0 for session-wide frames
//! varint messageType
//! varint bodyLength
//! bytes  body[bodyLength]
//! ```
//!
//! All varints are zig-zag signed LEB128 (little-endian, 7 bits per byte,
//! MSB = continuation), matching `binary.AppendVarint`-style encoders.

use crate::error::{TunnelError, TunnelResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Body string an ERROR frame carries for a clean end-of-stream.
const EOF_BODY: &[u8] = b"EOF";

const MAX_VARINT_LEN: usize = 10;

/// Append a zig-zag signed LEB128 varint.
pub fn put_varint(buf: &mut BytesMut, v: i64) {
    let mut ux = ((v << 1) ^ (v >> 63)) as u64;
    while ux >= 0x80 {
        buf.put_u8((ux as u8) | 0x80);
        ux >>= 7;
    }
    buf.put_u8(ux as u8);
}

/// Read a zig-zag signed LEB128 varint, advancing `data` past it.
pub fn read_varint(data: &mut &[u8]) -> TunnelResult<i64> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let Some(&b) = data.get(i) else {
            return Err(TunnelError::Framing("truncated varint".to_string()));
        };
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(TunnelError::Framing("varint overflows 64 bits".to_string()));
            }
            ux |= (b as u64) << shift;
            *data = &data[i + 1..];
            let v = (ux >> 1) as i64 ^ -((ux & 1) as i64);
            return Ok(v);
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(TunnelError::Framing("varint too long".to_string()))
}

/// Frame discriminator. The wire values are stable across implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageType {
    Connect = 1,
    AddClient = 2,
    RemoveClient = 3,
    Data = 4,
    Pause = 5,
    Resume = 6,
    SyncConnections = 7,
    Error = 8,
}

impl MessageType {
    /// Maps a wire value; `None` for unknown (reserved) types, which the
    /// session skips rather than rejects.
    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::AddClient),
            3 => Some(Self::RemoveClient),
            4 => Some(Self::Data),
            5 => Some(Self::Pause),
            6 => Some(Self::Resume),
            7 => Some(Self::SyncConnections),
            8 => Some(Self::Error),
            _ => None,
        }
    }
}

/// One decoded (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub conn_id: i64,
    pub message_type: MessageType,
    pub body: Bytes,
}

impl Message {
    pub fn connect(id: i64, conn_id: i64, proto: &str, address: &str) -> Self {
        Self {
            id,
            conn_id,
            message_type: MessageType::Connect,
            body: Bytes::from(format!("{proto}/{address}")),
        }
    }

    pub fn data(id: i64, conn_id: i64, body: Bytes) -> Self {
        Self {
            id,
            conn_id,
            message_type: MessageType::Data,
            body,
        }
    }

    pub fn pause(id: i64, conn_id: i64) -> Self {
        Self {
            id,
            conn_id,
            message_type: MessageType::Pause,
            body: Bytes::new(),
        }
    }

    pub fn resume(id: i64, conn_id: i64) -> Self {
        Self {
            id,
            conn_id,
            message_type: MessageType::Resume,
            body: Bytes::new(),
        }
    }

    /// An ERROR frame. `err == None` signals a clean end-of-stream.
    pub fn error(id: i64, conn_id: i64, err: Option<&TunnelError>) -> Self {
        let body = match err {
            Some(e) => Bytes::from(e.to_string()),
            None => Bytes::from_static(EOF_BODY),
        };
        Self {
            id,
            conn_id,
            message_type: MessageType::Error,
            body,
        }
    }

    /// ADDCLIENT/REMOVECLIENT body is `clientKey/sessionKey`.
    pub fn add_client(id: i64, client_key: &str, session_key: i64) -> Self {
        Self {
            id,
            conn_id: 0,
            message_type: MessageType::AddClient,
            body: Bytes::from(format!("{client_key}/{session_key}")),
        }
    }

    pub fn remove_client(id: i64, client_key: &str, session_key: i64) -> Self {
        Self {
            id,
            conn_id: 0,
            message_type: MessageType::RemoveClient,
            body: Bytes::from(format!("{client_key}/{session_key}")),
        }
    }

    pub fn sync_connections(id: i64, encoded_ids: Bytes) -> Self {
        Self {
            id,
            conn_id: 0,
            message_type: MessageType::SyncConnections,
            body: encoded_ids,
        }
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 * MAX_VARINT_LEN + self.body.len());
        put_varint(&mut buf, self.id);
        put_varint(&mut buf, self.conn_id);
        put_varint(&mut buf, self.message_type as i64);
        put_varint(&mut buf, self.body.len() as i64);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Decode one frame. Returns `Ok(None)` for an unknown message type
    /// (reserved for forward compatibility); malformed headers or short
    /// bodies are framing errors, fatal to the session.
    pub fn decode(frame: &Bytes) -> TunnelResult<Option<Message>> {
        let mut rest: &[u8] = frame;
        let id = read_varint(&mut rest)?;
        let conn_id = read_varint(&mut rest)?;
        let wire_type = read_varint(&mut rest)?;
        let body_len = read_varint(&mut rest)?;

        if body_len < 0 {
            return Err(TunnelError::Framing(format!(
                "negative body length {body_len}"
            )));
        }
        let body_len = body_len as usize;
        if rest.len() < body_len {
            return Err(TunnelError::Framing(format!(
                "message body short: want {body_len}, have {}",
                rest.len()
            )));
        }

        let Some(message_type) = MessageType::from_wire(wire_type) else {
            return Ok(None);
        };

        let offset = frame.len() - rest.len();
        let body = frame.slice(offset..offset + body_len);

        Ok(Some(Message {
            id,
            conn_id,
            message_type,
            body,
        }))
    }

    /// Parses a CONNECT body into `(proto, address)`.
    pub fn connect_target(&self) -> TunnelResult<(String, String)> {
        let s = std::str::from_utf8(&self.body)
            .map_err(|_| TunnelError::Framing("connect address is not utf-8".to_string()))?;
        let (proto, address) = s
            .split_once('/')
            .ok_or_else(|| TunnelError::Framing("failed to parse connect address".to_string()))?;
        Ok((proto.to_string(), address.to_string()))
    }

    /// Parses an ADDCLIENT/REMOVECLIENT body into `(clientKey, sessionKey)`.
    pub fn client_address(&self) -> TunnelResult<(String, i64)> {
        let s = std::str::from_utf8(&self.body)
            .map_err(|_| TunnelError::Framing("client address is not utf-8".to_string()))?;
        let (client_key, session_key) = s
            .split_once('/')
            .ok_or_else(|| TunnelError::Framing(format!("invalid remote session {s}")))?;
        let session_key = session_key
            .parse::<i64>()
            .map_err(|e| TunnelError::Framing(format!("invalid remote session {s}: {e}")))?;
        Ok((client_key.to_string(), session_key))
    }

    /// The error an ERROR frame carries. `None` means clean end-of-stream.
    pub fn remote_err(&self) -> Option<TunnelError> {
        if self.body == EOF_BODY {
            return None;
        }
        Some(TunnelError::Remote(
            String::from_utf8_lossy(&self.body).into_owned(),
        ))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type {
            MessageType::Connect => {
                write!(f, "CONNECT [{}:{}] {}", self.id, self.conn_id, String::from_utf8_lossy(&self.body))
            }
            MessageType::Data => {
                write!(f, "DATA [{}:{}] {} bytes", self.id, self.conn_id, self.body.len())
            }
            MessageType::Pause => write!(f, "PAUSE [{}:{}]", self.id, self.conn_id),
            MessageType::Resume => write!(f, "RESUME [{}:{}]", self.id, self.conn_id),
            MessageType::Error => {
                write!(f, "ERROR [{}:{}] {}", self.id, self.conn_id, String::from_utf8_lossy(&self.body))
            }
            MessageType::AddClient => {
                write!(f, "ADDCLIENT [{}] {}", self.id, String::from_utf8_lossy(&self.body))
            }
            MessageType::RemoveClient => {
                write!(f, "REMOVECLIENT [{}] {}", self.id, String::from_utf8_lossy(&self.body))
            }
            MessageType::SyncConnections => {
                write!(f, "SYNCCONNECTIONS [{}] {} ids", self.id, self.body.len() / 8)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_varint(v: i64) {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, v);
        let mut slice: &[u8] = &buf;
        assert_eq!(read_varint(&mut slice).unwrap(), v);
        assert!(slice.is_empty());
    }

    #[test]
    fn varint_round_trips() {
        for v in [0, 1, -1, 63, 64, -64, -65, 300, -300, i64::MAX, i64::MIN] {
            round_trip_varint(v);
        }
    }

    #[test]
    fn varint_truncated() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1 << 40);
        let short = &buf[..buf.len() - 1];
        let mut slice: &[u8] = short;
        assert!(matches!(
            read_varint(&mut slice),
            Err(TunnelError::Framing(_))
        ));
    }

    #[test]
    fn frame_round_trip() {
        let hostname = "h".repeat(255);
        let m = Message::connect(1, 1, "tcp", &format!("{hostname}:65500"));
        let decoded = Message::decode(&m.encode()).unwrap().unwrap();
        assert_eq!(decoded, m);
        let (proto, address) = decoded.connect_target().unwrap();
        assert_eq!(proto, "tcp");
        assert_eq!(address, format!("{hostname}:65500"));
    }

    #[test]
    fn data_round_trip() {
        let m = Message::data(7, 42, Bytes::from_static(b"hello"));
        let decoded = Message::decode(&m.encode()).unwrap().unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn truncated_body_is_framing_error() {
        let encoded = Message::connect(1, 1, "tcp", "host:80").encode();
        let truncated = encoded.slice(..encoded.len() - 2);
        assert!(matches!(
            Message::decode(&truncated),
            Err(TunnelError::Framing(_))
        ));
    }

    #[test]
    fn unknown_type_is_skipped() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 99);
        put_varint(&mut buf, 0);
        assert!(Message::decode(&buf.freeze()).unwrap().is_none());
    }

    #[test]
    fn error_eof_body_is_clean_close() {
        let m = Message::error(1, 3, None);
        assert!(m.remote_err().is_none());

        let m = Message::error(1, 3, Some(&TunnelError::ConnectNotAllowed));
        match m.remote_err() {
            Some(TunnelError::Remote(s)) => assert!(s.contains("connect not allowed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn client_address_parses() {
        let m = Message::add_client(1, "agent-1", 12345);
        let (key, session) = m.client_address().unwrap();
        assert_eq!(key, "agent-1");
        assert_eq!(session, 12345);

        let bad = Message {
            id: 1,
            conn_id: 0,
            message_type: MessageType::AddClient,
            body: Bytes::from_static(b"no-separator"),
        };
        assert!(bad.client_address().is_err());
    }
}
