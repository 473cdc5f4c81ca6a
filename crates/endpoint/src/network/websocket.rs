//! WebSocket transport over tokio-tungstenite.
//!
//! Each transport runs a writer task fed by a bounded channel and a reader
//! task forwarding frames as [`TransportEvent`]s. The number of bytes handed
//! to the writer but not yet written is reported as the buffered amount.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;
use xmn_protocol::{ProtocolError, Result};

use super::{Transport, TransportEvent, TransportState};

/// Capacity of the outgoing and event channels.
const CHANNEL_CAPACITY: usize = 256;

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

enum Outgoing {
    Data(Vec<u8>),
    Close,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    buffered: AtomicUsize,
}

impl Shared {
    fn new(state: TransportState) -> Self {
        Self {
            state: AtomicU8::new(encode_state(state)),
            buffered: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> TransportState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => TransportState::Connecting,
            STATE_OPEN => TransportState::Open,
            _ => TransportState::Closed,
        }
    }

    fn set(&self, state: TransportState) {
        self.state.store(encode_state(state), Ordering::Release);
    }

    /// Moves from `Connecting` to `Open`; fails if closed meanwhile.
    fn open(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

fn encode_state(state: TransportState) -> u8 {
    match state {
        TransportState::Connecting => STATE_CONNECTING,
        TransportState::Open => STATE_OPEN,
        TransportState::Closed => STATE_CLOSED,
    }
}

/// Maps a websocket error to a protocol error.
pub fn ws_error(err: WsError) -> ProtocolError {
    match err {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ProtocolError::ConnectionClosed(err.to_string())
        }
        _ => ProtocolError::Transport(format!("WebSocket error: {}", err)),
    }
}

/// A [`Transport`] backed by a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    outgoing: mpsc::Sender<Outgoing>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outgoing::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            Outgoing::Close => f.write_str("Close"),
        }
    }
}

impl WebSocketTransport {
    /// Starts connecting to `url` in the background.
    ///
    /// The transport is `Connecting` until the upgrade completes, then emits
    /// [`TransportEvent::Open`].
    pub fn connect(url: Url) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::new(TransportState::Connecting));

        let task_shared = shared.clone();
        tokio::spawn(async move {
            tracing::info!(
                host = url.host_str().unwrap_or_default(),
                port = url.port(),
                "Connecting to XMN server"
            );

            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    if !task_shared.open() {
                        tracing::debug!("Transport closed while connecting");
                        let _ = ws.close(None).await;
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                reason: "closed while connecting".to_string(),
                            })
                            .await;
                        return;
                    }
                    if event_tx.send(TransportEvent::Open).await.is_err() {
                        return;
                    }
                    run_io(ws, outgoing_rx, event_tx, task_shared).await;
                }
                Err(e) => {
                    tracing::warn!("WebSocket connection failed: {}", e);
                    task_shared.set(TransportState::Closed);
                    let reason = e.to_string();
                    let _ = event_tx.send(TransportEvent::Error(reason.clone())).await;
                    let _ = event_tx.send(TransportEvent::Closed { reason }).await;
                }
            }
        });

        (
            Self {
                outgoing: outgoing_tx,
                shared,
            },
            event_rx,
        )
    }

    /// Wraps an accepted, already upgraded stream.
    pub fn from_stream<S>(ws: WebSocketStream<S>) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::new(TransportState::Open));

        tokio::spawn(run_io(ws, outgoing_rx, event_tx, shared.clone()));

        (
            Self {
                outgoing: outgoing_tx,
                shared,
            },
            event_rx,
        )
    }
}

async fn run_io<S>(
    ws: WebSocketStream<S>,
    mut outgoing_rx: mpsc::Receiver<Outgoing>,
    event_tx: mpsc::Sender<TransportEvent>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = ws.split();

    // Spawn task to handle outgoing messages
    let writer_shared = shared.clone();
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = outgoing_rx.recv().await {
            match outgoing {
                Outgoing::Data(bytes) => {
                    let len = bytes.len();
                    let result = ws_sink.send(WsMessage::Binary(bytes)).await;
                    writer_shared.buffered.fetch_sub(len, Ordering::AcqRel);
                    if let Err(e) = result {
                        tracing::error!("failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Outgoing::Close => {
                    if let Err(e) = ws_sink.close().await {
                        tracing::debug!("WebSocket close failed: {}", e);
                    }
                    break;
                }
            }
        }
    });

    // Keep reading after a close frame so tungstenite can flush its reply.
    let mut reason = String::new();
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(WsMessage::Binary(data)) => {
                if event_tx.send(TransportEvent::Message(data)).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Text(text)) => {
                if event_tx
                    .send(TransportEvent::Message(text.into_bytes()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                shared.set(TransportState::Closed);
                reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                tracing::debug!(reason = %reason, "WebSocket close frame received");
            }
            Ok(_) => {
                // Ping/pong frames are answered by tungstenite
            }
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
            Err(e) => {
                reason = e.to_string();
                let _ = event_tx.send(TransportEvent::Error(reason.clone())).await;
                break;
            }
        }
    }

    shared.set(TransportState::Closed);
    writer.abort();
    let _ = event_tx.send(TransportEvent::Closed { reason }).await;
}

impl Transport for WebSocketTransport {
    fn state(&self) -> TransportState {
        self.shared.state()
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn send<'a>(&'a self, data: Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.state() != TransportState::Open {
                return Err(ProtocolError::NotConnected);
            }

            let len = data.len();
            self.shared.buffered.fetch_add(len, Ordering::AcqRel);
            if self.outgoing.send(Outgoing::Data(data)).await.is_err() {
                self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
                return Err(ProtocolError::ConnectionClosed(
                    "WebSocket writer stopped".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.state() == TransportState::Closed {
                return Ok(());
            }
            self.shared.set(TransportState::Closed);
            // The writer may already be gone if the peer closed first.
            let _ = self.outgoing.send(Outgoing::Close).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_binary() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[test]
    fn test_ws_error_mapping() {
        assert!(matches!(
            ws_error(WsError::ConnectionClosed),
            ProtocolError::ConnectionClosed(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(
            ws_error(WsError::Io(io)),
            ProtocolError::ConnectionClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let addr = echo_server().await;
        let url = Url::parse(&format!("ws://{}/public/x/y", addr)).unwrap();
        let (transport, mut events) = WebSocketTransport::connect(url);
        assert_eq!(transport.state(), TransportState::Connecting);

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(transport.state(), TransportState::Open);

        transport.send(vec![b'J', 1, 2, 3]).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Message(vec![b'J', 1, 2, 3]))
        );

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(matches!(
            transport.send(vec![1]).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let addr = echo_server().await;
        let url = Url::parse(&format!("ws://{}/", addr)).unwrap();
        let (transport, _events) = WebSocketTransport::connect(url);
        assert!(matches!(
            transport.send(vec![1]).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_closed() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url = Url::parse(&format!("ws://{}/", addr)).unwrap();
        let (transport, mut events) = WebSocketTransport::connect(url);

        assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Closed { .. })
        ));
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
