use thiserror::Error;

/// Errors produced by the tunnel core.
///
/// The enum is `Clone` because a stream's terminal error is replayed to
/// every subsequent reader and writer; variants therefore carry rendered
/// strings rather than source errors.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("wrong websocket message type")]
    WrongMessageType,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("read deadline exceeded")]
    ReadDeadlineExceeded,

    #[error("read timeout exceeded")]
    ReadTimeoutExceeded,

    #[error("timeout")]
    Timeout,

    #[error("closed pipe")]
    ClosedPipe,

    #[error("tunnel disconnect")]
    TunnelDisconnect,

    #[error("connect not allowed")]
    ConnectNotAllowed,

    /// Reported by the peer in an ERROR frame.
    #[error("{0}")]
    Remote(String),

    /// Close reason for streams reclaimed by connection-set reconciliation.
    /// Never sent on the wire.
    #[error("sync from client")]
    SyncReclaimed,

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        TunnelError::Io(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
