//! Hub connector over WebSocket.

use async_trait::async_trait;
use canopy_core::{Connection, Connector, LinkError};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::AgentError;

/// Opens WebSocket connections to the hub.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Create a connector for `hub_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidHubUrl`] unless the URL parses with a
    /// `ws` scheme. `wss` is rejected since the agent is built without TLS.
    pub fn new(hub_url: &str) -> Result<Self, AgentError> {
        let url = Url::parse(hub_url).map_err(|e| AgentError::InvalidHubUrl {
            url: hub_url.to_string(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "ws" {
            return Err(AgentError::InvalidHubUrl {
                url: hub_url.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(Self { url })
    }

    /// Target URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

/// One open WebSocket connection.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self) -> Result<Self::Conn, LinkError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;
        Ok(WsConnection { stream })
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, payload: &str) -> Result<(), LinkError> {
        self.stream
            .send(Message::Text(payload.to_owned().into()))
            .await
            .map_err(link_error)
    }

    async fn recv(&mut self) -> Option<Result<String, LinkError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // tungstenite queues pong replies itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(link_error(e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn link_error(err: tungstenite::Error) -> LinkError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            LinkError::TransportClosed
        }
        other => LinkError::Transport(other.to_string()),
    }
}
