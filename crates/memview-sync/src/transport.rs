use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel connect failed: {0}")]
    Connect(String),
    #[error("channel send failed: {0}")]
    Send(String),
    #[error("channel receive failed: {0}")]
    Receive(String),
}

/// One open real-time channel carrying text frames.
pub trait Channel: Send + Sync + 'static {
    fn send_text(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound text frame. `None` once the peer closed the channel.
    fn next_text(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    fn connect(&self) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}

/// Timer used for reconnect and poll delays.
pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl Connector for WsConnector {
    type Channel = WsChannel;

    async fn connect(&self) -> Result<WsChannel, TransportError> {
        debug!(event = "ws_connect", url = %self.url);
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(WsChannel { stream })
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Channel for WsChannel {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(err) => warn!(event = "ws_binary_dropped", error = %err),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(TransportError::Receive(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
