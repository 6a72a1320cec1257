//! WebSocket transport shell.
//!
//! Thin wrapper around `tokio-tungstenite` that performs the connect / TLS /
//! upgrade sequence against `wss://<host>:<port>/v2?appkey=<key>` and pumps
//! frames for the protocol core. Inbound pings are answered by the library;
//! pongs are surfaced so the core can correlate them with its own pings.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use super::client::WriteItem;
use super::pdu::WireMessage;
use crate::config::RtmConfig;
use crate::error::Result;
use crate::stats::client as metrics;

/// One event surfaced to the protocol core.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete text or binary message.
    Payload(Vec<u8>),
    /// A pong frame with its payload.
    Pong(Vec<u8>),
    /// The peer closed the stream or the read side ended.
    Closed,
}

/// A connected WebSocket.
pub struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsConnection {
    /// Resolve, connect, complete the TLS handshake, and upgrade. Each step
    /// failure surfaces as a distinct [`tokio_tungstenite::tungstenite::Error`]
    /// variant; nothing is left half-open on failure.
    pub async fn connect(config: &RtmConfig) -> Result<Self> {
        let url = config.url();
        tracing::info!(endpoint = %config.endpoint, port = %config.port, "connecting rtm client");

        let mut request = url.into_client_request()?;
        if let Some(protocol) = config.wire.subprotocol() {
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(protocol),
            );
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(config.max_message_size),
            ..Default::default()
        };

        let (ws, response) = connect_async_with_config(request, Some(ws_config), true).await?;
        tracing::info!(status = %response.status(), "websocket open");

        Ok(Self { ws })
    }

    /// Wait for the next event from the peer.
    pub async fn next_event(&mut self) -> Result<TransportEvent> {
        loop {
            match self.ws.next().await {
                None => return Ok(TransportEvent::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    return Ok(TransportEvent::Payload(text.into_bytes()))
                }
                Some(Ok(Message::Binary(data))) => return Ok(TransportEvent::Payload(data)),
                Some(Ok(Message::Pong(payload))) => return Ok(TransportEvent::Pong(payload)),
                Some(Ok(Message::Ping(payload))) => {
                    // The library queues the matching pong.
                    tracing::trace!(bytes = payload.len(), "ping frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(frame = ?frame, "close frame");
                    return Ok(TransportEvent::Closed);
                }
                Some(Ok(Message::Frame(_))) => {}
            }
        }
    }

    /// Perform one write. The caller (the reactor loop) guarantees at most
    /// one of these is in progress at a time.
    pub async fn send(&mut self, item: WriteItem) -> Result<()> {
        let message = match item {
            WriteItem::Message(WireMessage::Text(text)) => Message::Text(text),
            WriteItem::Message(WireMessage::Binary(data)) => Message::Binary(data),
            WriteItem::Ping(payload) => Message::Ping(payload),
        };
        self.ws.send(message).await?;
        Ok(())
    }

    /// Close the stream. Errors are irrelevant at this point; the read side
    /// observes the closure either way.
    pub async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!(error = %e, "close failed");
            metrics::CLIENT_ERRORS
                .with_label_values(&["close_connection"])
                .inc();
        }
    }
}
