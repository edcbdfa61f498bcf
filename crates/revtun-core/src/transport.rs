//! Transport seam between the session and whatever carries its frames.
//!
//! The session only needs a message-framed, ordered, reliable channel:
//! a sink it can push one encoded frame at a time into, and a source that
//! yields whole binary messages. WebSocket is the shipped implementation;
//! tests substitute channel-backed fakes.

use crate::error::{TunnelError, TunnelResult};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Outbound half of the transport. One `send` call emits one whole frame;
/// the session serializes calls, so implementations need not.
pub trait FrameSink: Send {
    fn send(&mut self, frame: Bytes) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + '_>>;

    /// Best-effort close notification to the peer.
    fn close<'a>(
        &'a mut self,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;
}

/// Inbound half of the transport. `Ok(None)` is a clean end of transport.
pub trait FrameSource: Send {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = TunnelResult<Option<Bytes>>> + Send + '_>>;
}

/// Split a WebSocket into the session's sink/source pair.
pub fn websocket_transport<S>(ws: WebSocketStream<S>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (Box::new(WsSink { sink }), Box::new(WsSource { stream }))
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, frame: Bytes) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.sink
                .send(WsMessage::Binary(frame))
                .await
                .map_err(|e| TunnelError::Transport(format!("websocket write: {e}")))
        })
    }

    fn close<'a>(
        &'a mut self,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            };
            self.sink
                .send(WsMessage::Close(Some(frame)))
                .await
                .map_err(|e| TunnelError::Transport(format!("websocket close: {e}")))
        })
    }
}

struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn next(&mut self) -> Pin<Box<dyn Future<Output = TunnelResult<Option<Bytes>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data)),
                    // Ping/pong are handled inside tungstenite; frames are
                    // internal to the split driver.
                    Some(Ok(WsMessage::Ping(_)))
                    | Some(Ok(WsMessage::Pong(_)))
                    | Some(Ok(WsMessage::Frame(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    // Only binary messages carry tunnel frames; anything
                    // else is a protocol violation, fatal to the session.
                    Some(Ok(WsMessage::Text(_))) => return Err(TunnelError::WrongMessageType),
                    Some(Err(e)) => {
                        return Err(TunnelError::Transport(format!("websocket read: {e}")))
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}
