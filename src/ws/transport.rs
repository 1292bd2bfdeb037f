//! WebSocket transport
//!
//! Thin wrapper over tokio-tungstenite: connect with timeout, TCP_NODELAY,
//! text frames in and out. The session splits the stream so one task reads
//! while another writes.

use crate::{ClientError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connected WebSocket transport
pub struct WsTransport {
    stream: WsStream,
}

/// Write half of a split transport
pub struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

/// Read half of a split transport
pub struct WsSource {
    stream: SplitStream<WsStream>,
}

impl WsTransport {
    /// Open the transport with a connect timeout
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout("connect".into()))?
            .map_err(|e| ClientError::Transport(format!("connection failed: {e}")))?;

        // Disable Nagle's algorithm - send frames immediately
        let nodelay = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.set_nodelay(true),
            MaybeTlsStream::Rustls(tls) => tls.get_ref().0.set_nodelay(true),
            _ => Ok(()),
        };
        nodelay.map_err(|e| ClientError::Transport(format!("set_nodelay failed: {e}")))?;

        Ok(Self { stream: ws_stream })
    }

    /// Split into independently owned read and write halves
    pub fn split(self) -> (WsSink, WsSource) {
        let (sink, stream) = self.stream.split();
        (WsSink { sink }, WsSource { stream })
    }
}

impl WsSink {
    /// Send one text frame
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::Transport(format!("send failed: {e}")))
    }

    /// Close the connection gracefully
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| ClientError::Transport(format!("close failed: {e}")))
    }
}

impl WsSource {
    /// Receive the next text frame
    ///
    /// Transport-level ping/pong and binary frames are skipped; `Ok(None)`
    /// means the peer closed the connection.
    pub async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ClientError::Transport(format!("receive failed: {e}")))
                }
            }
        }
    }
}
