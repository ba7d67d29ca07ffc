//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for one ComfyUI
//! server. Call [`ComfyUIClient::connect`] with the session's client id
//! to establish a live [`ComfyUIConnection`]. The client never retries
//! on its own; see [`crate::reconnect`] for the backoff loop.

use std::time::Duration;

use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default bound on the WebSocket handshake.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The concrete stream type produced by [`ComfyUIClient::connect`].
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI instance.
///
/// Stores the WebSocket and HTTP API URLs needed to communicate with
/// one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
    dial_timeout: Duration,
}

/// A live WebSocket connection to a ComfyUI instance.
#[derive(Debug)]
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake. ComfyUI addresses
    /// job events to this id.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(ws_url: String, api_url: String) -> Self {
        Self {
            ws_url,
            api_url,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Connect to the ComfyUI WebSocket endpoint as `client_id`.
    ///
    /// The id is passed as the `clientId` query parameter so that
    /// ComfyUI routes job events for prompts submitted under the same
    /// id to this connection. Fails with
    /// [`ComfyUIClientError::Timeout`] when the handshake does not
    /// complete within the dial timeout.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) =
            match tokio::time::timeout(self.dial_timeout, connect_async(url.as_str())).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(ComfyUIClientError::Connection(format!(
                        "Failed to connect to ComfyUI at {}: {e}",
                        self.ws_url
                    )))
                }
                Err(_) => {
                    return Err(ComfyUIClientError::Timeout(format!(
                        "Handshake with {} did not complete within {}ms",
                        self.ws_url,
                        self.dial_timeout.as_millis()
                    )))
                }
            };

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Send a close frame and wait for the peer to acknowledge.
    ///
    /// A connection that is already closed is not an error.
    pub async fn close(mut self) -> Result<(), ComfyUIClientError> {
        match self.ws_stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                tracing::debug!(client_id = %self.client_id, "ComfyUI connection closed");
                Ok(())
            }
            Err(e) => Err(ComfyUIClientError::Protocol(e.to_string())),
        }
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The handshake did not complete within the dial timeout.
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ComfyUIClient::new(format!("ws://{addr}"), format!("http://{addr}"));
        let result = client.connect("abc").await;
        assert_matches!(result, Err(ComfyUIClientError::Connection(_)));
    }

    #[tokio::test]
    async fn silent_server_hits_dial_timeout() {
        // Accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ComfyUIClient::new(format!("ws://{addr}"), format!("http://{addr}"))
            .with_dial_timeout(Duration::from_millis(100));
        let result = client.connect("abc").await;
        assert_matches!(result, Err(ComfyUIClientError::Timeout(_)));
        drop(listener);
    }
}
