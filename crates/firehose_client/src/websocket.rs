//! WebSocket transport over `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{FirehoseError, FirehoseResult};
use crate::transport::{FrameTransport, TransportMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the peer's close reply.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A WebSocket transport to a relay (`ws://` or `wss://`).
pub struct WebSocketTransport {
    stream: Option<WsStream>,
    max_message_size: usize,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Creates a transport accepting messages up to `max_message_size`.
    pub fn new(max_message_size: usize, connect_timeout: Duration) -> Self {
        Self {
            stream: None,
            max_message_size,
            connect_timeout,
        }
    }

    fn socket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn connect(&mut self, url: &str) -> FirehoseResult<()> {
        let connecting = connect_async_with_config(url, Some(self.socket_config()), false);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| FirehoseError::Timeout)?
            .map_err(transport_error)?;

        debug!(status = %response.status(), "websocket handshake complete");
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_message(&mut self) -> FirehoseResult<Option<TransportMessage>> {
        let stream = self.stream.as_mut().ok_or(FirehoseError::NotConnected)?;
        loop {
            let message = match stream.next().await {
                None => return Ok(None),
                Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                Some(Err(err)) => return Err(transport_error(err)),
                Some(Ok(message)) => message,
            };
            match message {
                Message::Binary(data) => return Ok(Some(TransportMessage::Binary(Bytes::from(data)))),
                Message::Text(text) => return Ok(Some(TransportMessage::Text(text))),
                Message::Close(frame) => {
                    debug!(?frame, "close frame received");
                    return Ok(Some(TransportMessage::Close));
                }
                // Pongs are queued by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> FirehoseResult<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        match stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
            Err(err) => return Err(transport_error(err)),
        }

        // Drain until the peer acknowledges the close.
        let drain = async { while let Some(Ok(_)) = stream.next().await {} };
        if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
            warn!("peer did not complete the close handshake");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn transport_error(err: WsError) -> FirehoseError {
    match &err {
        WsError::Url(_) | WsError::HttpFormat(_) => FirehoseError::transport_fatal(err.to_string()),
        WsError::Http(response) if response.status().is_client_error() => {
            FirehoseError::transport_fatal(err.to_string())
        }
        _ => FirehoseError::transport_retryable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_config_limits_messages() {
        let transport = WebSocketTransport::new(1024, Duration::from_secs(1));
        let config = transport.socket_config();
        assert_eq!(config.max_message_size, Some(1024));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn invalid_url_is_fatal() {
        let mut transport = WebSocketTransport::new(1024, Duration::from_secs(1));
        let err = transport.connect("not a url").await.unwrap_err();
        assert!(matches!(err, FirehoseError::Transport { retryable: false, .. }));
    }

    #[tokio::test]
    async fn next_message_requires_connection() {
        let mut transport = WebSocketTransport::new(1024, Duration::from_secs(1));
        assert!(matches!(
            transport.next_message().await,
            Err(FirehoseError::NotConnected)
        ));
        // Closing an unconnected transport is a no-op.
        transport.close().await.unwrap();
    }
}
