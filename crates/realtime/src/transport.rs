//! The socket seam under the connection manager.
//!
//! `Transport::open` dials a URL and hands back the two halves of a text
//! channel. Production code uses `WebSocketTransport`; tests swap in a fake.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, protocol::Message},
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("socket error: {0}")]
    Socket(String),
}

impl From<WsError> for TransportError {
    fn from(e: WsError) -> Self {
        TransportError::Socket(e.to_string())
    }
}

/// Write half of an open channel.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Read half of an open channel. `None` means the peer closed it.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;
}

pub type OpenChannel = (Box<dyn FrameSink>, Box<dyn FrameStream>);

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<OpenChannel, TransportError>;
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` client transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<OpenChannel, TransportError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let (writer, reader) = socket.split();
        Ok((Box::new(WsSink(writer)), Box::new(WsStream(reader))))
    }
}

struct WsSink(SplitSink<Socket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            debug!(error = %e, "Error while closing socket.");
        }
    }
}

struct WsStream(SplitStream<Socket>);

#[async_trait]
impl FrameStream for WsStream {
    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Peer closed the socket.");
                    return None;
                }
                // Control and binary frames carry nothing for the chat protocol.
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
