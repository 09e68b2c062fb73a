//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. [`connect`] handles URL→request building, header
//! insertion and TLS negotiation; [`WsConnector`] adapts the halves to the
//! [`Connector`] boundary so the connection manager only sees JSON frames.
//!
//! Control frames never reach the manager: tungstenite queues pong replies
//! for protocol-level pings itself, and application heartbeats are regular
//! JSON text frames.

// Rust guideline compliant 2026-02

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use super::{Connector, FrameSink, FrameSource, Link};
use crate::error::{ClientError, Result};
use crate::protocol::{self, Frame};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
    closed: bool,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        self.send_text(&text)
            .await
            .map_err(|e| ClientError::Transport(format!("{e:#}")))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.send(tungstenite::Message::Close(None)).await {
            log::debug!("[WebSocket] close frame not sent: {e}");
        }
        if let Err(e) = self.sink.close().await {
            log::debug!("[WebSocket] sink close failed: {e}");
        }
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(protocol::parse_text(&text));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    let parsed = std::str::from_utf8(&data)
                        .map_err(|e| ClientError::Protocol(format!("binary frame: {e}")))
                        .and_then(protocol::parse_text);
                    return Some(parsed);
                }
                Some(Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                )) => continue,
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Err(ClientError::Transport(format!(
                        "closed by server ({code}) {reason}"
                    ))));
                }
                Some(Err(e)) => {
                    return Some(Err(ClientError::Transport(format!(
                        "WebSocket read error: {e}"
                    ))));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> anyhow::Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((
        WsWriter {
            sink,
            closed: false,
        },
        WsReader { stream },
    ))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}

/// [`Connector`] that opens a WebSocket to a fixed URL.
#[derive(Clone)]
pub struct WsConnector {
    url: String,
    token: Option<String>,
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WsConnector {
    /// Create a connector for `url` (http(s) URLs are converted to ws(s)).
    pub fn new(url: &str, token: Option<String>) -> Self {
        Self {
            url: http_to_ws_scheme(url),
            token,
        }
    }

    /// Target WebSocket URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link> {
        let auth = self.token.as_ref().map(|t| format!("Bearer {t}"));
        let headers: Vec<(&str, &str)> = auth
            .as_deref()
            .map(|value| vec![("Authorization", value)])
            .unwrap_or_default();

        log::debug!("[WebSocket] connecting to {}", self.url);
        let (writer, reader) = connect(&self.url, &headers)
            .await
            .map_err(|e| ClientError::Transport(format!("{e:#}")))?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme_https() {
        assert_eq!(
            http_to_ws_scheme("https://chat.example.com/ws"),
            "wss://chat.example.com/ws"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_http() {
        assert_eq!(
            http_to_ws_scheme("http://localhost:3000/ws"),
            "ws://localhost:3000/ws"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_passthrough() {
        assert_eq!(http_to_ws_scheme("wss://a.b/ws"), "wss://a.b/ws");
        assert_eq!(http_to_ws_scheme("ws://a.b/ws"), "ws://a.b/ws");
    }

    #[test]
    fn test_connector_debug_redacts_token() {
        let connector = WsConnector::new("http://localhost:3000/ws", Some("secret".into()));
        let debug = format!("{connector:?}");
        assert!(!debug.contains("secret"));
        assert_eq!(connector.url(), "ws://localhost:3000/ws");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_transport_error() {
        let connector = WsConnector::new("not-a-url", None);
        let result = connector.connect().await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/invalid", &[]).await;
        assert!(result.is_err());
    }
}
