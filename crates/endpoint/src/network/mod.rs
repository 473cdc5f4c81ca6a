//! Network module for XMN transports.
//!
//! This module provides:
//! - The [`Transport`] trait the connection driver writes through
//! - WebSocket transports for both endpoints ([`websocket`])
//! - Handshake URL construction and parsing

pub mod websocket;

use std::future::Future;
use std::pin::Pin;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use url::Url;
use xmn_protocol::{ProtocolError, Result};

/// Path segment of public (unauthenticated) channels.
pub const PUBLIC_PATH: &str = "public";

/// Path segment of private (authenticated) channels.
pub const PRIVATE_PATH: &str = "private";

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Opening; nothing can be written yet.
    Connecting,
    /// Open for writes.
    Open,
    /// Closed, locally or by the peer.
    Closed,
}

/// Lifecycle and data events surfaced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport finished opening.
    Open,
    /// A complete message arrived.
    Message(Vec<u8>),
    /// The transport closed.
    Closed {
        /// Close reason, possibly empty.
        reason: String,
    },
    /// A transport error; followed by `Closed`.
    Error(String),
}

/// A message-oriented, ordered, reliable transport.
///
/// Incoming traffic is delivered separately as [`TransportEvent`]s so the
/// driver can `select!` over it.
pub trait Transport: Send + Sync {
    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Bytes accepted by [`Transport::send`] but not yet written.
    fn buffered_amount(&self) -> usize;

    /// Writes one message.
    fn send<'a>(&'a self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Closes the transport gracefully.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Whether the transport is open and has nothing buffered.
    fn is_writable(&self) -> bool {
        self.state() == TransportState::Open && self.buffered_amount() == 0
    }
}

/// Builds the handshake URL carrying the header and the first body.
///
/// `ws://<host>[:<port>]/<public|private>/<enc(b64(header))>/<enc(b64(body))>`
pub fn build_handshake_url(
    host: &str,
    port: Option<u16>,
    public: bool,
    header: &[u8],
    body: &[u8],
) -> Result<Url> {
    let authority = match port {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let channel = if public { PUBLIC_PATH } else { PRIVATE_PATH };
    let header = urlencoding::encode(&BASE64.encode(header)).into_owned();
    let body = urlencoding::encode(&BASE64.encode(body)).into_owned();

    let raw = format!("ws://{}/{}/{}/{}", authority, channel, header, body);
    Url::parse(&raw).map_err(|e| ProtocolError::Transport(format!("invalid handshake URL: {}", e)))
}

/// Decoded segments of a handshake request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePath {
    /// Public channel rather than a private one.
    pub public: bool,
    /// Encoded handshake header.
    pub header: Vec<u8>,
    /// First body; empty if the client sent none.
    pub body: Vec<u8>,
}

/// Parses `/<public|private>/<header>/<body>` from a request path.
pub fn parse_handshake_path(path: &str) -> Result<HandshakePath> {
    let mut segments = path.trim_start_matches('/').split('/');

    let public = match segments.next() {
        Some(PUBLIC_PATH) => true,
        Some(PRIVATE_PATH) => false,
        other => {
            return Err(ProtocolError::InvalidHeader(format!(
                "unknown channel: {:?}",
                other.unwrap_or_default()
            )))
        }
    };

    let header = decode_segment(segments.next().unwrap_or_default())?;
    if header.is_empty() {
        return Err(ProtocolError::InvalidHeader("missing header segment".to_string()));
    }
    let body = decode_segment(segments.next().unwrap_or_default())?;

    if segments.next().is_some() {
        return Err(ProtocolError::InvalidHeader("unexpected path segments".to_string()));
    }

    Ok(HandshakePath {
        public,
        header,
        body,
    })
}

fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    let decoded = urlencoding::decode(segment)
        .map_err(|e| ProtocolError::InvalidHeader(format!("invalid path encoding: {}", e)))?;
    BASE64
        .decode(decoded.as_bytes())
        .map_err(|e| ProtocolError::InvalidHeader(format!("invalid base64 segment: {}", e)))
}

// Re-export key types
pub use websocket::WebSocketTransport;
