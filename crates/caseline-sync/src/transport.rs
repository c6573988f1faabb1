//! # Transport Boundary
//!
//! The engine talks to the coordination service through a [`TransportFactory`]
//! that opens a [`TransportConnection`]: a sink and a stream of text frames.
//! The production implementation is [`WebSocketTransport`]; tests inject an
//! in-process relay.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Connection States                                    │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure (first connect)      │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │  disconnect()│ Connected  │  │   Error    │ (needs connect()) │
//! │        └──────────────┴─────┬──────┘  └────────────┘                   │
//! │                             │ abnormal close / pong timeout             │
//! │                             ▼                                           │
//! │                       ┌────────────┐  backoff elapses                   │
//! │                       │Reconnecting│ ─────────────────► Connecting     │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  BACKOFF STRATEGY (exponential, no jitter)                             │
//! │  ─────────────────────────────────────────                             │
//! │  Attempt 1: 1s, Attempt 2: 1.5s, Attempt 3: 2.25s ... Max: 30s          │
//! │  Reset to 1s after every successful connection.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the engine. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected, no reconnect pending.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting out the backoff delay after an abnormal close.
    Reconnecting,
    /// The initial connect failed. Requires an explicit `connect` to recover.
    Error,
}

impl ConnectionState {
    /// Returns true for [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed (close frame or end of stream).
    #[error("connection closed")]
    ConnectionClosed,

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Transport Traits
// =============================================================================

/// Outgoing half of a connection: accepts text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half of a connection: yields text frames until closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<String>> + Send>>;

/// One open duplex connection.
pub struct TransportConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection").finish_non_exhaustive()
    }
}

/// Opens connections to the coordination service.
///
/// Object-safe so the engine can hold an `Arc<dyn TransportFactory>` and
/// tests can substitute an in-process relay.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a connection to `url`. The engine bounds this with its connect timeout.
    async fn connect(&self, url: &str) -> TransportResult<TransportConnection>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// [`TransportFactory`] over `tokio-tungstenite`.
///
/// ## Frame Mapping
/// - Text frames map 1:1
/// - Binary frames are decoded as UTF-8 when possible, otherwise dropped
/// - WebSocket-level ping/pong is answered by tungstenite itself
/// - A close frame ends the stream with [`TransportError::ConnectionClosed`]
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        WebSocketTransport
    }

    async fn open(url: &str) -> TransportResult<TransportConnection> {
        let (ws_stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        info!(status = ?response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|text: String| async move { Ok::<_, TransportError>(WsMessage::Text(text.into())) });

        let stream = read.filter_map(|frame| async move {
            match frame {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame");
                        None
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Received close frame");
                    Some(Err(TransportError::ConnectionClosed))
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => None,
                Err(e) => Some(Err(TransportError::ReceiveFailed(e.to_string()))),
            }
        });

        Ok(TransportConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransport {
    async fn connect(&self, url: &str) -> TransportResult<TransportConnection> {
        Self::open(url).await
    }
}
