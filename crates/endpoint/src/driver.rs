//! Per-connection event loop.
//!
//! A [`ConnectionDriver`] exclusively owns one connection's state: its
//! [`ConnectionInfo`] (keys, identity, watermark), pending registry and
//! keep-alive timer. It runs as a single task, selecting over:
//!
//! ```text
//!   transport events ──┐
//!   app commands ──────┤
//!   housekeeping tick ─┼──▶ ConnectionDriver ──▶ Transport
//!   keep-alive timer ──┤
//!   handler results ───┘
//! ```
//!
//! Applications talk to the driver through a cloneable [`ConnectionHandle`].
//! Request handlers run concurrently in a `JoinSet`; everything that touches
//! connection state happens on the driver task.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xmn_protocol::{
    now_millis, sys_event, BodyCodec, ClientIdentity, IvMode, Payload, ProtocolError,
    ProviderConfig, Result, RotateKey, SyncKey, WireObject, WireSysEvent,
};

use crate::config::ProtocolConfig;
use crate::connection::{ConnectionId, ConnectionInfo};
use crate::keepalive::KeepAlive;
use crate::network::{Transport, TransportEvent, TransportState};
use crate::pending::{Completion, PendingRegistry};
use crate::router::{upgrade_client_identity, Router};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Tuning for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bodies above this many bytes are considered for deflate.
    pub compression_threshold: usize,
    /// Idle time before a ping is sent.
    pub ping_interval: Duration,
    /// Period of the pending-table sweep.
    pub housekeeping_interval: Duration,
    /// Sent requests older than this fail with `Timeout`.
    pub request_timeout: Option<Duration>,
    /// How AES-CBC IVs are chosen.
    pub iv_mode: IvMode,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for ConnectionSettings {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            compression_threshold: config.compression_threshold,
            ping_interval: config.ping_interval(),
            housekeeping_interval: config.housekeeping_interval(),
            request_timeout: config.request_timeout(),
            iv_mode: config.iv_mode,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands from a [`ConnectionHandle`] to its driver.
#[derive(Debug)]
pub(crate) enum Command {
    Request {
        api: String,
        data: Payload,
        reply: Completion,
    },
    Event {
        name: String,
        data: Payload,
        reply: Completion,
    },
    SysEvent {
        name: String,
        data: Payload,
        reply: Reply<()>,
    },
    Binary {
        object: WireObject,
        bytes: Vec<u8>,
        reply: Reply<()>,
    },
    RotateKey {
        reply: Reply<()>,
    },
    UpgradeIdentity {
        fields: ClientIdentity,
        reply: Reply<bool>,
    },
    Close,
}

impl Command {
    fn fail(self, err: ProtocolError) {
        match self {
            Command::Request { reply, .. } | Command::Event { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::SysEvent { reply, .. }
            | Command::Binary { reply, .. }
            | Command::RotateKey { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::UpgradeIdentity { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Close => {}
        }
    }
}

/// Application-side handle to a running connection.
///
/// Every method fails with `NotConnected` once the driver has stopped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ProtocolError::NotConnected)?;
        rx.await.map_err(|_| ProtocolError::NotConnected)?
    }

    /// Sends a request and waits for its correlated response.
    pub async fn request(&self, api: &str, data: impl Into<Payload>) -> Result<Payload> {
        let api = api.to_string();
        let data = data.into();
        self.submit(|reply| Command::Request { api, data, reply })
            .await
    }

    /// Sends an event; resolves once it has been written.
    pub async fn send_event(&self, name: &str, data: impl Into<Payload>) -> Result<()> {
        let name = name.to_string();
        let data = data.into();
        self.submit(|reply| Command::Event { name, data, reply })
            .await
            .map(|_| ())
    }

    /// Sends a system event immediately; fails if the transport is not open.
    pub async fn send_sys_event(&self, name: &str, data: impl Into<Payload>) -> Result<()> {
        let name = name.to_string();
        let data = data.into();
        self.submit(|reply| Command::SysEvent { name, data, reply })
            .await
    }

    /// Tells the peer to ping after `ms_ping_interval` ms of idleness.
    pub async fn push_provider_config(&self, ms_ping_interval: u64) -> Result<()> {
        let config = serde_json::to_value(ProviderConfig { ms_ping_interval })?;
        self.send_sys_event(sys_event::PROVIDER_CONFIG, config).await
    }

    /// Generates a new sync key, sends it to the peer and switches to it.
    pub async fn rotate_key(&self) -> Result<()> {
        self.submit(|reply| Command::RotateKey { reply }).await
    }

    /// Merges identity fields; pushes the result to the peer if changed.
    ///
    /// Returns whether anything changed.
    pub async fn upgrade_client_identity(&self, fields: ClientIdentity) -> Result<bool> {
        self.submit(|reply| Command::UpgradeIdentity { fields, reply })
            .await
    }

    /// Sends `object` as a binary frame carrying `bytes`.
    pub async fn send_binary(&self, object: WireObject, bytes: Vec<u8>) -> Result<()> {
        self.submit(|reply| Command::Binary {
            object,
            bytes,
            reply,
        })
        .await
    }

    /// Asks the driver to close the connection.
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Close).await;
    }

    pub(crate) async fn send_command(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|e| {
            e.0.fail(ProtocolError::NotConnected);
            ProtocolError::NotConnected
        })
    }
}

/// The single task owning one connection.
pub struct ConnectionDriver {
    ci: ConnectionInfo,
    commands: mpsc::Receiver<Command>,
    router: Router,
    codec: BodyCodec,
    pending: PendingRegistry,
    keepalive: KeepAlive,
    settings: ConnectionSettings,
    inflight: JoinSet<WireObject>,
    last_sent_event_ts: u64,
    initial_body: Option<Vec<u8>>,
    identity_sink: Option<watch::Sender<ClientIdentity>>,
    shutdown: CancellationToken,
}

impl ConnectionDriver {
    /// Creates a driver and the handle applications use to reach it.
    pub fn new(
        ci: ConnectionInfo,
        router: Router,
        settings: ConnectionSettings,
    ) -> (Self, ConnectionHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = ConnectionHandle { id: ci.id, tx };

        let driver = Self {
            ci,
            commands,
            router,
            codec: BodyCodec::new(settings.compression_threshold),
            pending: PendingRegistry::new(),
            keepalive: KeepAlive::new(settings.ping_interval, Instant::now()),
            settings,
            inflight: JoinSet::new(),
            last_sent_event_ts: 0,
            initial_body: None,
            identity_sink: None,
            shutdown: CancellationToken::new(),
        };
        (driver, handle)
    }

    /// Stops the driver when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Publishes identities the peer pushes with `upgrade_client_identity`.
    pub fn with_identity_sink(mut self, sink: watch::Sender<ClientIdentity>) -> Self {
        self.identity_sink = Some(sink);
        self
    }

    /// A body received with the handshake, processed before any traffic.
    pub fn with_initial_body(mut self, body: Vec<u8>) -> Self {
        if !body.is_empty() {
            self.initial_body = Some(body);
        }
        self
    }

    /// Connection state owned by this driver.
    pub fn connection(&self) -> &ConnectionInfo {
        &self.ci
    }

    /// Encodes the first outbound call for delivery inside the handshake URL.
    ///
    /// The call is recorded as sent; its completion resolves when the peer
    /// answers over the transport. Generates the sync key if needed.
    pub(crate) async fn prepare_first_body(&mut self, command: Command) -> Result<Vec<u8>> {
        let (seq, ts) = match command {
            Command::Request { api, data, reply } => {
                let seq = self.pending.queue_request(api, now_millis(), data, reply);
                (seq, None)
            }
            Command::Event { name, data, reply } => {
                let ts = self.next_event_ts();
                let id = self.pending.queue_event(name, ts, data, reply);
                (id, Some(ts))
            }
            other => {
                other.fail(ProtocolError::NotConnected);
                return Err(ProtocolError::NotConnected);
            }
        };

        let object = self
            .pending
            .wire_object(seq)
            .ok_or(ProtocolError::NotConnected)?;
        let body = self.codec.encode(&mut self.ci.keys, &[object]).await?;
        self.pending.mark_sent(seq, Instant::now());
        self.keepalive.record_send(Instant::now());

        debug!(
            connection_id = %self.ci.id,
            seq,
            event_ts = ts,
            wire = body.len(),
            "Prepared handshake body"
        );
        Ok(body)
    }

    /// Event timestamps strictly increase per connection so the peer's
    /// watermark never drops two events issued within one millisecond.
    fn next_event_ts(&mut self) -> u64 {
        let ts = now_millis().max(self.last_sent_event_ts + 1);
        self.last_sent_event_ts = ts;
        ts
    }

    /// Runs the connection until it closes.
    pub async fn run(
        mut self,
        transport: Box<dyn Transport>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let transport: &dyn Transport = &*transport;
        let connection_id = self.ci.id;

        let mut housekeeping = tokio::time::interval(self.settings.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        housekeeping.tick().await;

        info!(
            %connection_id,
            host = %self.ci.host,
            public = self.ci.public,
            permission = %self.ci.permission,
            "Connection started"
        );

        let mut reason = None;
        if let Some(body) = self.initial_body.take() {
            if let Err(e) = self.handle_body(transport, &body).await {
                reason = Some(format!("handshake body rejected: {}", e));
            }
        }

        let reason = match reason {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break "shutdown".to_string(),

                    event = events.recv() => match event {
                        Some(TransportEvent::Open) => {
                            info!(%connection_id, "Transport open");
                        }
                        Some(TransportEvent::Message(data)) => {
                            if let Err(e) = self.handle_body(transport, &data).await {
                                if e.is_fatal() {
                                    error!(%connection_id, "Fatal protocol error: {}", e);
                                    break e.to_string();
                                }
                                warn!(%connection_id, "Failed to handle message: {}", e);
                            }
                        }
                        Some(TransportEvent::Error(e)) => {
                            warn!(%connection_id, "Transport error: {}", e);
                        }
                        Some(TransportEvent::Closed { reason }) => break reason,
                        None => break "transport gone".to_string(),
                    },

                    command = self.commands.recv() => match command {
                        Some(Command::Close) => break "closed locally".to_string(),
                        Some(command) => self.handle_command(transport, command).await,
                        None => break "all handles dropped".to_string(),
                    },

                    _ = housekeeping.tick() => self.housekeep(transport).await,

                    _ = sleep_until(self.keepalive.deadline()) => self.on_keepalive(transport).await,

                    Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                        match joined {
                            Ok(response) => {
                                if let Err(e) = self.send_objects(transport, vec![response]).await {
                                    warn!(%connection_id, "Failed to send response: {}", e);
                                }
                            }
                            Err(e) => error!(%connection_id, "Request handler task failed: {}", e),
                        }
                    }
                }
            },
        };

        self.teardown(transport, &reason).await;
    }

    async fn teardown(&mut self, transport: &dyn Transport, reason: &str) {
        if let Err(e) = transport.close().await {
            debug!(connection_id = %self.ci.id, "Transport close failed: {}", e);
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.fail(ProtocolError::NotConnected);
        }
        self.inflight.abort_all();
        let failed = self.pending.fail_all();

        info!(
            connection_id = %self.ci.id,
            reason = %reason,
            failed,
            "Connection closed"
        );
    }

    async fn send_objects(
        &mut self,
        transport: &dyn Transport,
        objects: Vec<WireObject>,
    ) -> Result<()> {
        let body = self.codec.encode(&mut self.ci.keys, &objects).await?;
        transport.send(body).await?;
        self.keepalive.record_send(Instant::now());
        Ok(())
    }

    async fn handle_body(&mut self, transport: &dyn Transport, data: &[u8]) -> Result<()> {
        let objects = self.codec.decode(&mut self.ci.keys, data).await?;
        for object in objects {
            self.handle_object(transport, object).await?;
        }
        Ok(())
    }

    async fn handle_object(&mut self, transport: &dyn Transport, object: WireObject) -> Result<()> {
        match object {
            WireObject::Request(request) => {
                let response = self.router.dispatch_request(&self.ci, request);
                self.inflight.spawn(response);
            }
            WireObject::Response(response) => {
                self.pending.resolve(response);
            }
            WireObject::Event(event) => {
                let response = self.router.dispatch_event(&mut self.ci, event).await;
                if let Err(e) = self.send_objects(transport, vec![response]).await {
                    warn!(connection_id = %self.ci.id, "Failed to send event response: {}", e);
                }
            }
            WireObject::EventResponse(response) => match &response.error {
                None => debug!(name = %response.name, seq = response.seq, "Event acknowledged"),
                Some(error) => warn!(
                    name = %response.name,
                    seq = response.seq,
                    error = %error,
                    "Peer rejected event"
                ),
            },
            WireObject::SysEvent(event) => self.handle_sys_event(event)?,
        }
        Ok(())
    }

    fn handle_sys_event(&mut self, event: WireSysEvent) -> Result<()> {
        let connection_id = self.ci.id;
        match event.name.as_str() {
            sys_event::PING => {
                debug!(%connection_id, "Ping received");
            }
            sys_event::PROVIDER_CONFIG => {
                let config: ProviderConfig = match serde_json::from_value(event.data.into_json()) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(%connection_id, "Ignoring malformed provider config: {}", e);
                        return Ok(());
                    }
                };
                if config.ms_ping_interval == 0 {
                    warn!(%connection_id, "Ignoring provider config with zero ping interval");
                } else {
                    let interval = Duration::from_millis(config.ms_ping_interval);
                    self.keepalive.set_interval(interval, Instant::now());
                    info!(
                        %connection_id,
                        ms_ping_interval = config.ms_ping_interval,
                        "Ping interval reconfigured"
                    );
                }
            }
            sys_event::UPGRADE_CLIENT_IDENTITY => match event.data.into_json() {
                Value::Object(identity) => {
                    debug!(%connection_id, fields = identity.len(), "Client identity replaced");
                    if let Some(sink) = &self.identity_sink {
                        sink.send_replace(identity.clone());
                    }
                    self.ci.client_identity = identity;
                }
                other => warn!(%connection_id, "Ignoring non-object client identity: {}", other),
            },
            sys_event::ROTATE_KEY => {
                let rotation: RotateKey = match serde_json::from_value(event.data.into_json()) {
                    Ok(rotation) => rotation,
                    Err(e) => {
                        warn!(%connection_id, "Ignoring malformed key rotation: {}", e);
                        return Ok(());
                    }
                };
                self.ci.keys.rotate(&rotation)?;
            }
            other => {
                warn!(%connection_id, name = other, "Unknown system event");
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, transport: &dyn Transport, command: Command) {
        match command {
            Command::Request { api, data, reply } => {
                let seq = self.pending.queue_request(api, now_millis(), data, reply);
                self.try_send_pending(transport, seq).await;
            }
            Command::Event { name, data, reply } => {
                let ts = self.next_event_ts();
                let id = self.pending.queue_event(name, ts, data, reply);
                self.try_send_pending(transport, id).await;
            }
            Command::SysEvent { name, data, reply } => {
                let result = match transport.state() {
                    TransportState::Open => {
                        self.send_objects(transport, vec![WireObject::sys_event(name, data)])
                            .await
                    }
                    _ => Err(ProtocolError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Binary {
                object,
                bytes,
                reply,
            } => {
                let result = self.send_binary(transport, &object, &bytes).await;
                let _ = reply.send(result);
            }
            Command::RotateKey { reply } => {
                let result = self.rotate_key(transport).await;
                let _ = reply.send(result);
            }
            Command::UpgradeIdentity { fields, reply } => {
                let result = match upgrade_client_identity(&mut self.ci, fields) {
                    Some(push) if transport.state() == TransportState::Open => {
                        self.send_objects(transport, vec![push]).await.map(|_| true)
                    }
                    Some(_) => Ok(true),
                    None => Ok(false),
                };
                let _ = reply.send(result);
            }
            Command::Close => {}
        }
    }

    /// Writes a freshly queued entry now if the transport allows it;
    /// otherwise it waits for the next housekeeping pass.
    async fn try_send_pending(&mut self, transport: &dyn Transport, seq: u64) {
        if !transport.is_writable() {
            debug!(connection_id = %self.ci.id, seq, "Transport not writable, queued");
            return;
        }
        let Some(object) = self.pending.wire_object(seq) else {
            return;
        };
        match self.send_objects(transport, vec![object]).await {
            Ok(()) => self.pending.mark_sent(seq, Instant::now()),
            Err(e) => warn!(connection_id = %self.ci.id, seq, "Send failed, queued: {}", e),
        }
    }

    async fn send_binary(
        &mut self,
        transport: &dyn Transport,
        object: &WireObject,
        bytes: &[u8],
    ) -> Result<()> {
        if transport.state() != TransportState::Open {
            return Err(ProtocolError::NotConnected);
        }
        let body = self.codec.encode_binary(&mut self.ci.keys, object, bytes)?;
        transport.send(body).await?;
        self.keepalive.record_send(Instant::now());
        Ok(())
    }

    async fn rotate_key(&mut self, transport: &dyn Transport) -> Result<()> {
        if transport.state() != TransportState::Open {
            return Err(ProtocolError::NotConnected);
        }
        let new_key = SyncKey::generate();
        let rotation = self.ci.keys.wrap_rotation(&new_key)?;
        let push = WireObject::sys_event(sys_event::ROTATE_KEY, serde_json::to_value(rotation)?);
        self.send_objects(transport, vec![push]).await?;
        self.ci.keys.commit_rotation(new_key);
        Ok(())
    }

    async fn housekeep(&mut self, transport: &dyn Transport) {
        let now = Instant::now();
        let state = transport.state();

        if state == TransportState::Closed {
            self.pending.fail_all();
            return;
        }

        if let Some(timeout) = self.settings.request_timeout {
            self.pending.expire(now, timeout);
        }

        if !transport.is_writable() {
            return;
        }

        let flush = self.pending.flushable();
        if flush.is_empty() {
            return;
        }

        let (ids, objects): (Vec<u64>, Vec<WireObject>) = flush.into_iter().unzip();
        let count = ids.len();
        match self.send_objects(transport, objects).await {
            Ok(()) => {
                for id in ids {
                    self.pending.mark_sent(id, now);
                }
                debug!(connection_id = %self.ci.id, count, "Flushed queued calls");
            }
            Err(e) => warn!(connection_id = %self.ci.id, count, "Flush failed: {}", e),
        }
    }

    async fn on_keepalive(&mut self, transport: &dyn Transport) {
        if !self.keepalive.on_timer(Instant::now()) {
            return;
        }
        if transport.state() != TransportState::Open {
            return;
        }
        if let Err(e) = self.send_objects(transport, vec![WireObject::ping()]).await {
            warn!(connection_id = %self.ci.id, "Ping failed: {}", e);
        }
    }
}
