//! Client endpoint.
//!
//! The client connects lazily: the first call's body travels inside the
//! handshake URL, so nothing is dialed until there is something to send.
//! Later calls go through the running driver. If the connection drops, the
//! next call reconnects with a fresh sync key.

use anyhow::Context;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info};
use xmn_protocol::{
    now_millis, ClientIdentity, HeaderCodec, HeaderInfo, Payload, ProtocolError, Result,
    ServerPublicKey, ShortCode, UniqueId,
};

use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionInfo, Permission};
use crate::driver::{Command, ConnectionDriver, ConnectionHandle, ConnectionSettings};
use crate::network::{build_handshake_url, WebSocketTransport};
use crate::router::Router;

/// Where and as whom a client connects.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host.
    pub host: String,
    /// Server port; omitted from the URL when `None`.
    pub port: Option<u16>,
    /// Use the public channel.
    pub public: bool,
    /// Application short code.
    pub short_code: ShortCode,
    /// Installation id.
    pub unique_id: UniqueId,
    /// Key the sync key is wrapped against.
    pub server_public_key: ServerPublicKey,
    /// Network type reported in the handshake.
    pub network_type: Option<String>,
    /// Coarse location reported in the handshake.
    pub location: Option<Value>,
    /// Initial client identity fields.
    pub client_identity: ClientIdentity,
    /// Per-connection tuning.
    pub settings: ConnectionSettings,
}

impl ClientOptions {
    /// Options with no network type, location or identity.
    pub fn new(
        host: impl Into<String>,
        port: Option<u16>,
        short_code: ShortCode,
        unique_id: UniqueId,
        server_public_key: ServerPublicKey,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            public: true,
            short_code,
            unique_id,
            server_public_key,
            network_type: None,
            location: None,
            client_identity: ClientIdentity::new(),
            settings: ConnectionSettings::default(),
        }
    }

    /// Builds options from the `[client]` and `[protocol]` sections.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = &config.client;
        let short_code = client
            .short_code()
            .context("Invalid client.short_code")?;
        let unique_id = client
            .unique_id()
            .context("Invalid client.unique_id")?;
        let server_public_key = client.load_server_public_key()?;

        let mut options = Self::new(
            client.host.clone(),
            client.port,
            short_code,
            unique_id,
            server_public_key,
        );
        options.public = client.public;
        options.settings = ConnectionSettings::from(&config.protocol);
        Ok(options)
    }
}

/// An XMN client.
///
/// Incoming requests and events from the server are dispatched to the
/// client's [`Router`]; the server is trusted with every permission.
pub struct XmnClient {
    options: ClientOptions,
    router: Router,
    identity: watch::Sender<ClientIdentity>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl XmnClient {
    /// Creates a client; nothing is dialed until the first call.
    pub fn new(options: ClientOptions, router: Router) -> Self {
        let (identity, _) = watch::channel(options.client_identity.clone());
        Self {
            options,
            router,
            identity,
            connection: Mutex::new(None),
        }
    }

    /// Creates a client from configuration.
    pub fn from_config(config: &Config, router: Router) -> anyhow::Result<Self> {
        Ok(Self::new(ClientOptions::from_config(config)?, router))
    }

    /// Connection options.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Whether a connection is currently running.
    pub async fn is_connected(&self) -> bool {
        self.live_handle().await.is_some()
    }

    /// Id of the running connection, if any.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.live_handle().await.map(|handle| handle.id())
    }

    /// Sends a request and waits for the server's response.
    pub async fn request(&self, api: &str, data: impl Into<Payload>) -> Result<Payload> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Request {
            api: api.to_string(),
            data: data.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProtocolError::NotConnected)?
    }

    /// Sends an event; resolves once it has been written.
    pub async fn send_event(&self, name: &str, data: impl Into<Payload>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Event {
            name: name.to_string(),
            data: data.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProtocolError::NotConnected)?.map(|_| ())
    }

    /// Merges identity fields.
    ///
    /// While connected, changes are pushed to the server; otherwise they are
    /// carried in the next handshake. Returns whether anything changed.
    pub async fn upgrade_client_identity(&self, fields: ClientIdentity) -> Result<bool> {
        let changed = self.identity.send_if_modified(|identity| {
            let mut changed = false;
            for (key, value) in &fields {
                if identity.get(key) != Some(value) {
                    identity.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
            changed
        });

        match self.live_handle().await {
            Some(handle) => handle.upgrade_client_identity(fields).await,
            None => Ok(changed),
        }
    }

    /// Current client identity, including fields the server pushed.
    pub async fn client_identity(&self) -> ClientIdentity {
        self.identity.borrow().clone()
    }

    /// Watches the client identity for changes from either side.
    pub fn watch_identity(&self) -> watch::Receiver<ClientIdentity> {
        self.identity.subscribe()
    }

    /// Rotates the sync key of the running connection.
    pub async fn rotate_key(&self) -> Result<()> {
        self.live_handle()
            .await
            .ok_or(ProtocolError::NotConnected)?
            .rotate_key()
            .await
    }

    /// Closes the running connection, if any.
    pub async fn close(&self) {
        if let Some(handle) = self.connection.lock().await.take() {
            handle.close().await;
        }
    }

    async fn live_handle(&self) -> Option<ConnectionHandle> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if let Some(handle) = connection.as_ref().filter(|handle| !handle.is_closed()) {
            return handle.send_command(command).await;
        }

        let handle = self.connect(command).await?;
        *connection = Some(handle);
        Ok(())
    }

    /// Opens a connection whose handshake carries `first`.
    async fn connect(&self, first: Command) -> Result<ConnectionHandle> {
        let options = &self.options;
        let iv_mode = options.settings.iv_mode;

        let mut ci = ConnectionInfo::client(&options.host, options.port, options.public, iv_mode);
        ci.permission = Permission::Admin;
        ci.short_code = Some(options.short_code.clone());
        ci.unique_id = Some(options.unique_id);
        ci.network_type = options.network_type.clone();
        ci.location = options.location.clone();
        ci.client_identity = self.identity.borrow().clone();

        let mut info = HeaderInfo::new(options.short_code.clone(), options.unique_id, now_millis());
        info.network_type = options.network_type.clone();
        info.location = options.location.clone();
        info.client_identity = ci.client_identity.clone();

        let (driver, handle) =
            ConnectionDriver::new(ci, self.router.clone(), options.settings.clone());
        let mut driver = driver.with_identity_sink(self.identity.clone());
        let body = driver.prepare_first_body(first).await?;

        let key = driver
            .connection()
            .keys
            .current()
            .ok_or_else(|| ProtocolError::Encryption("sync key missing after first body".to_string()))?;
        let header = HeaderCodec::new(iv_mode).encode(&info, key, &options.server_public_key)?;
        let url = build_handshake_url(&options.host, options.port, options.public, &header, &body)?;

        debug!(
            connection_id = %handle.id(),
            url_len = url.as_str().len(),
            "Built handshake URL"
        );

        let (transport, events) = WebSocketTransport::connect(url);
        tokio::spawn(driver.run(Box::new(transport), events));

        info!(
            connection_id = %handle.id(),
            host = %options.host,
            public = options.public,
            "Connecting to XMN server"
        );
        Ok(handle)
    }
}
