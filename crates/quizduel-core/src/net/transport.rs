//! Socket transport
//!
//! The engine only talks to the server through [`Connector`] and
//! [`Transport`]. The production implementation speaks WebSocket text
//! frames via tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::DuelError;

/// An open, bidirectional text channel to the duel server
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame
    async fn send(&mut self, text: String) -> Result<(), DuelError>;

    /// Next inbound text frame; `None` once the server has closed the channel
    async fn recv(&mut self) -> Option<Result<String, DuelError>>;

    /// Close the channel
    async fn close(&mut self) -> Result<(), DuelError>;
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`, authenticating with `token`
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Transport>, DuelError>;
}

/// Connector for WebSocket duel servers
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Transport>, DuelError> {
        debug!("Connecting to {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| DuelError::Transport(format!("Invalid server URL '{}': {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| DuelError::Transport("Auth token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| DuelError::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// A connected WebSocket
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), DuelError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| DuelError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, DuelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8(data).map_err(|_| {
                        DuelError::Protocol("Binary frame is not valid UTF-8".into())
                    }));
                }
                Ok(Message::Close(_)) => return None,
                // Ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => return Some(Err(DuelError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), DuelError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| DuelError::Transport(e.to_string()))
    }
}
