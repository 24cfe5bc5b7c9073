// # Federation Transports
//
// A link's I/O runs over a duplex message channel carrying one JSON frame
// per message. Framing and TLS are the host's concern; the engine only
// sees [`MessageTransport`]. Two implementations:
//
// - [`DuplexTransport`]: in-process pair over tokio channels, used by
//   tests and embedded peers.
// - [`WsTransport`]: text-framed WebSocket via tokio-tungstenite, for real
//   network links.

use crate::federation::messages::{FrameCodec, WireFrame};
use crate::{Result, RhizomeError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Duplex, frame-at-a-time message channel.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, frame: WireFrame) -> Result<()>;

    /// Next inbound frame; `None` when the remote closed cleanly.
    async fn recv(&mut self) -> Result<Option<WireFrame>>;

    async fn close(&mut self) -> Result<()>;
}

// ============================================================================
// In-Process Duplex
// ============================================================================

/// One end of an in-process transport pair.
pub struct DuplexTransport {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl DuplexTransport {
    /// Connected pair of transports; frames sent on one end arrive at the
    /// other.
    pub fn pair() -> (DuplexTransport, DuplexTransport) {
        let (a_tx, a_rx) = mpsc::channel(256);
        let (b_tx, b_rx) = mpsc::channel(256);
        (
            DuplexTransport { tx: a_tx, rx: b_rx },
            DuplexTransport { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl MessageTransport for DuplexTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let text = FrameCodec::encode(&frame)?;
        self.tx
            .send(text)
            .await
            .map_err(|_| RhizomeError::ConnectionLost("duplex peer closed".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<WireFrame>> {
        match self.rx.recv().await {
            Some(text) => FrameCodec::decode(&text).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

// ============================================================================
// WebSocket
// ============================================================================

/// Text-framed WebSocket transport.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

/// Client-side WebSocket transport as produced by [`connect_ws`].
pub type WsClientTransport = WsTransport<MaybeTlsStream<TcpStream>>;

impl<S> WsTransport<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

/// Dial a WebSocket federation endpoint (`ws://host:port/path`).
pub async fn connect_ws(url: &str) -> Result<WsTransport<MaybeTlsStream<TcpStream>>> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| RhizomeError::ConnectionLost(format!("connect {url}: {e}")))?;
    Ok(WsTransport::new(stream))
}

/// Accept one inbound WebSocket connection on an already-accepted TCP
/// stream.
pub async fn accept_ws(stream: TcpStream) -> Result<WsTransport<TcpStream>> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| RhizomeError::ConnectionLost(format!("websocket accept: {e}")))?;
    Ok(WsTransport::new(ws))
}

#[async_trait]
impl<S> MessageTransport for WsTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let text = FrameCodec::encode(&frame)?;
        self.inner
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| RhizomeError::ConnectionLost(format!("websocket send: {e}")))
    }

    async fn recv(&mut self) -> Result<Option<WireFrame>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => {
                    return Err(RhizomeError::ConnectionLost(format!("websocket recv: {e}")))
                }
                Some(Ok(WsMessage::Text(text))) => {
                    return FrameCodec::decode(text.as_str()).map(Some)
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
                        RhizomeError::Serialization("binary frame is not UTF-8 JSON".to_string())
                    })?;
                    return FrameCodec::decode(&text).map(Some);
                }
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                // Transport-level keepalive; protocol ping/pong is ours.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Frame(_))) => {
                    return Err(RhizomeError::Serialization(
                        "unexpected raw websocket frame".to_string(),
                    ))
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close(None)
            .await
            .map_err(|e| RhizomeError::ConnectionLost(format!("websocket close: {e}")))
    }
}
