//! Server endpoint.
//!
//! Accepts websocket upgrades on `/<public|private>/<header>/<body>`. Paths
//! that do not parse are refused with `400 Bad Request` during the HTTP
//! upgrade. The header's RSA unwrap runs on the blocking pool once the
//! socket is up, and an undecryptable header closes it. Accepted connections
//! are verified, given a driver, and tracked in a [`ConnectionMap`] until
//! they close.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xmn_protocol::{
    now_millis, ClientIdentity, HandshakeHeader, HeaderCodec, Payload, ProtocolError, Result,
    ServerPrivateKey, WireObject,
};

use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionInfo, Permission};
use crate::driver::{ConnectionDriver, ConnectionHandle, ConnectionSettings};
use crate::network::websocket::ws_error;
use crate::network::{parse_handshake_path, HandshakePath, Transport, WebSocketTransport};
use crate::router::Router;

/// Decides whether an accepted connection may proceed, and at what level.
pub trait ConnectionVerifier: Send + Sync {
    /// Returns the granted permission, or `None` to reject the connection.
    fn verify<'a>(
        &'a self,
        ci: &'a ConnectionInfo,
    ) -> Pin<Box<dyn Future<Output = Option<Permission>> + Send + 'a>>;
}

/// Grants `PublicEncrypted` on public channels and `Session` on private ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVerifier;

impl ConnectionVerifier for DefaultVerifier {
    fn verify<'a>(
        &'a self,
        ci: &'a ConnectionInfo,
    ) -> Pin<Box<dyn Future<Output = Option<Permission>> + Send + 'a>> {
        let permission = if ci.public {
            Permission::PublicEncrypted
        } else {
            Permission::Session
        };
        Box::pin(async move { Some(permission) })
    }
}

/// Active connections by id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMap {
    inner: Arc<DashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, handle: ConnectionHandle) {
        self.inner.insert(handle.id(), handle);
    }

    fn remove(&self, id: &ConnectionId) {
        self.inner.remove(id);
    }

    /// Handle of a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.inner.get(id).map(|entry| entry.value().clone())
    }

    /// Whether `id` is a live connection.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.contains_key(id)
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Everything a connection task needs from its server.
#[derive(Clone)]
struct AcceptContext {
    private_key: Arc<ServerPrivateKey>,
    router: Router,
    settings: ConnectionSettings,
    verifier: Arc<dyn ConnectionVerifier>,
    provider_ping_interval: Option<u64>,
    connections: ConnectionMap,
}

/// An XMN server.
pub struct XmnServer {
    listener: TcpListener,
    context: AcceptContext,
    shutdown: CancellationToken,
}

impl XmnServer {
    /// Binds `addr`; connections are served once [`XmnServer::serve`] runs.
    pub async fn bind(addr: &str, private_key: ServerPrivateKey, router: Router) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind XMN server to {}", addr))?;

        Ok(Self {
            listener,
            context: AcceptContext {
                private_key: Arc::new(private_key),
                router,
                settings: ConnectionSettings::default(),
                verifier: Arc::new(DefaultVerifier),
                provider_ping_interval: None,
                connections: ConnectionMap::new(),
            },
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds and configures from the `[server]` and `[protocol]` sections.
    pub async fn from_config(config: &Config, router: Router) -> anyhow::Result<Self> {
        let private_key = config.server.load_private_key()?;
        let server = Self::bind(&config.server.listen_addr, private_key, router)
            .await?
            .with_settings(ConnectionSettings::from(&config.protocol));

        Ok(match config.server.ping_interval_ms {
            0 => server,
            ms => server.with_provider_ping_interval(ms),
        })
    }

    /// Per-connection tuning.
    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.context.settings = settings;
        self
    }

    /// Replaces the [`DefaultVerifier`].
    pub fn with_verifier(mut self, verifier: impl ConnectionVerifier + 'static) -> Self {
        self.context.verifier = Arc::new(verifier);
        self
    }

    /// Pushes this ping interval to every client on connect.
    pub fn with_provider_ping_interval(mut self, ms_ping_interval: u64) -> Self {
        self.context.provider_ping_interval = Some(ms_ping_interval);
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live connections.
    pub fn connections(&self) -> &ConnectionMap {
        &self.context.connections
    }

    /// Token that stops the server and all its connections when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accepts connections until shut down.
    pub async fn serve(&self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "XMN server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("XMN server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.context.clone();
                        let token = self.shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = accept_connection(stream, peer, context, token).await {
                                warn!(%peer, "Connection rejected: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
            }
        }

        Ok(())
    }

    fn handle(&self, id: &ConnectionId) -> Result<ConnectionHandle> {
        self.context
            .connections
            .get(id)
            .ok_or(ProtocolError::NotConnected)
    }

    /// Sends a request to a client and waits for its response.
    pub async fn request(&self, id: &ConnectionId, api: &str, data: impl Into<Payload>) -> Result<Payload> {
        self.handle(id)?.request(api, data).await
    }

    /// Sends an event to a client.
    pub async fn send_event(&self, id: &ConnectionId, name: &str, data: impl Into<Payload>) -> Result<()> {
        self.handle(id)?.send_event(name, data).await
    }

    /// Sends a system event to a client.
    pub async fn send_sys_event(
        &self,
        id: &ConnectionId,
        name: &str,
        data: impl Into<Payload>,
    ) -> Result<()> {
        self.handle(id)?.send_sys_event(name, data).await
    }

    /// Pushes a ping interval to a client.
    pub async fn push_provider_config(&self, id: &ConnectionId, ms_ping_interval: u64) -> Result<()> {
        self.handle(id)?.push_provider_config(ms_ping_interval).await
    }

    /// Rotates a connection's sync key.
    pub async fn rotate_key(&self, id: &ConnectionId) -> Result<()> {
        self.handle(id)?.rotate_key().await
    }

    /// Merges identity fields into a connection and pushes them if changed.
    pub async fn upgrade_client_identity(&self, id: &ConnectionId, fields: ClientIdentity) -> Result<bool> {
        self.handle(id)?.upgrade_client_identity(fields).await
    }

    /// Sends `object` with raw bytes as a binary frame.
    pub async fn send_binary(&self, id: &ConnectionId, object: WireObject, bytes: Vec<u8>) -> Result<()> {
        self.handle(id)?.send_binary(object, bytes).await
    }

    /// Closes a connection.
    pub async fn close(&self, id: &ConnectionId) {
        if let Some(handle) = self.context.connections.get(id) {
            handle.close().await;
        }
    }
}

fn bad_request(reason: &ProtocolError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Upgrades, verifies and serves one connection until it closes.
async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: AcceptContext,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut handshake: Option<(String, HandshakePath)> = None;
    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match parse_handshake_path(path) {
            Ok(parsed) => {
                handshake = Some((path.to_string(), parsed));
                Ok(response)
            }
            Err(e) => {
                debug!(%peer, path, "Refusing handshake: {}", e);
                Err(bad_request(&e))
            }
        }
    };

    let ws = accept_hdr_async(stream, callback).await.map_err(ws_error)?;
    let (path, parsed) = handshake
        .ok_or_else(|| ProtocolError::InvalidHeader("handshake not captured".to_string()))?;
    let HandshakePath { public, header, body } = parsed;
    let (transport, events) = WebSocketTransport::from_stream(ws);

    let codec = HeaderCodec::new(context.settings.iv_mode);
    let header = match decode_header(codec, context.private_key.clone(), header).await {
        Ok(header) => header,
        Err(e) => {
            debug!(%peer, "Closing connection with undecodable header: {}", e);
            transport.close().await?;
            return Err(e);
        }
    };

    let mut ci = ConnectionInfo::server(
        peer.to_string(),
        path,
        public,
        header,
        now_millis(),
        context.settings.iv_mode,
    );
    match context.verifier.verify(&ci).await {
        Some(permission) => ci.permission = permission,
        None => {
            transport.close().await?;
            return Err(ProtocolError::PermissionDenied(format!(
                "connection from {} refused by verifier",
                peer
            )));
        }
    }

    info!(
        connection_id = %ci.id,
        %peer,
        short_code = ?ci.short_code.as_ref().map(|code| code.to_string()),
        unique_id = ?ci.unique_id.map(|id| id.to_string()),
        ms_offset = ci.ms_offset,
        permission = %ci.permission,
        "Accepted XMN connection"
    );

    let id = ci.id;
    let (driver, handle) = ConnectionDriver::new(ci, context.router.clone(), context.settings.clone());
    let driver = driver
        .with_shutdown(shutdown)
        .with_initial_body(body);

    context.connections.insert(handle.clone());
    let running = tokio::spawn(driver.run(Box::new(transport), events));

    if let Some(ms) = context.provider_ping_interval {
        if let Err(e) = handle.push_provider_config(ms).await {
            warn!(connection_id = %id, "Failed to push provider config: {}", e);
        }
    }

    if let Err(e) = running.await {
        error!(connection_id = %id, "Connection task failed: {}", e);
    }
    context.connections.remove(&id);
    Ok(())
}

/// Decodes a handshake header on the blocking pool.
async fn decode_header(
    codec: HeaderCodec,
    private_key: Arc<ServerPrivateKey>,
    header: Vec<u8>,
) -> Result<HandshakeHeader> {
    tokio::task::spawn_blocking(move || codec.decode(&header, &private_key))
        .await
        .map_err(|e| ProtocolError::InvalidHeader(format!("header task failed: {}", e)))?
}
