//! Message router for dispatching incoming requests and events to handlers.
//!
//! Handlers are registered once at startup in a [`RouterBuilder`], each under
//! a name with a minimum [`Permission`]. A handler is either a closure or a
//! method exported by an [`XmnProvider`], which is constructed fresh for every
//! dispatch. Registration fails fast on duplicate names and on names the
//! provider does not export.
//!
//! Dispatch never fails the connection: unknown names, permission failures,
//! handler errors and handler panics all become correlated error responses.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use xmn_protocol::{
    sys_event, ClientIdentity, Payload, ProtocolError, WireEvent, WireObject, WireRequest,
};

use crate::connection::{ConnectionId, ConnectionInfo, Permission};

/// Error raised by an application handler.
///
/// `name` travels in the response's `error` field and `message` in its
/// `data`, mirroring how the peer reports its own failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerError {
    /// Error name, e.g. `NotFound`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::new("Error", format!("{:#}", err))
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        HandlerError::new(err.code(), err.to_string())
    }
}

/// Result of a handler invocation.
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

type Handler = Arc<dyn Fn(InvocationContext) -> HandlerFuture + Send + Sync>;

/// Everything a handler learns about one invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Api or event name.
    pub name: String,
    /// Peer timestamp converted to local time.
    pub ts: u64,
    /// Connection the call arrived on.
    pub connection_id: ConnectionId,
    /// Permission granted to that connection.
    pub permission: Permission,
    /// Client identity at dispatch time.
    pub client_identity: ClientIdentity,
    /// Call parameters.
    pub params: Payload,
}

impl InvocationContext {
    /// Deserializes JSON parameters into `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let value = self.params.as_json().cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| HandlerError::new("InvalidParams", e.to_string()))
    }
}

/// A source of handlers, constructed fresh for every dispatch.
///
/// `EXPORTS` lists the names [`XmnProvider::call`] understands; registering
/// any other name against the provider fails at startup.
pub trait XmnProvider: Send + 'static {
    /// Provider name used in diagnostics.
    const NAME: &'static str;

    /// Names this provider can handle.
    const EXPORTS: &'static [&'static str];

    /// Creates a provider instance for one invocation.
    fn create() -> Self
    where
        Self: Sized;

    /// Handles `ctx.name`.
    fn call(self, ctx: InvocationContext) -> HandlerFuture;
}

/// Errors produced while dispatching a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// No request handler with this name.
    #[error("unknown api: {0}")]
    UnknownApi(String),

    /// No event handler with this name.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The connection's permission is below the handler's minimum.
    #[error("{name} requires {required}, connection has {granted}")]
    PermissionDenied {
        /// Handler name.
        name: String,
        /// Minimum permission of the handler.
        required: Permission,
        /// Permission granted to the connection.
        granted: Permission,
    },

    /// The handler returned an error.
    #[error("handler error: {0}")]
    Handler(HandlerError),

    /// The handler panicked.
    #[error("handler {0} panicked")]
    Panicked(String),
}

impl RouterError {
    /// Value for the response's `error` field.
    pub fn code(&self) -> String {
        match self {
            RouterError::UnknownApi(_) => "UnknownApi".to_string(),
            RouterError::UnknownEvent(_) => "UnknownEvent".to_string(),
            RouterError::PermissionDenied { .. } => "PermissionDenied".to_string(),
            RouterError::Handler(e) => e.name.clone(),
            RouterError::Panicked(_) => "HandlerFault".to_string(),
        }
    }

    /// Value for the response's `data` field.
    pub fn message(&self) -> String {
        match self {
            RouterError::UnknownApi(name) | RouterError::UnknownEvent(name) => name.clone(),
            RouterError::Handler(e) => e.message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone)]
struct Registration {
    handler: Handler,
    permission: Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registry {
    Api,
    Event,
}

impl Registry {
    fn as_str(self) -> &'static str {
        match self {
            Registry::Api => "api",
            Registry::Event => "event",
        }
    }
}

/// Builds a [`Router`].
#[derive(Default)]
pub struct RouterBuilder {
    apis: HashMap<String, Registration>,
    events: HashMap<String, Registration>,
    providers: HashMap<&'static str, (&'static [&'static str], BTreeSet<String>)>,
}

impl RouterBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers provider method `name` as a request handler.
    pub fn api<P: XmnProvider>(
        self,
        name: &str,
        permission: Permission,
    ) -> xmn_protocol::Result<Self> {
        self.register_provider::<P>(Registry::Api, name, permission)
    }

    /// Registers provider method `name` as an event handler.
    pub fn event<P: XmnProvider>(
        self,
        name: &str,
        permission: Permission,
    ) -> xmn_protocol::Result<Self> {
        self.register_provider::<P>(Registry::Event, name, permission)
    }

    /// Registers a closure as a request handler.
    pub fn api_fn<F, Fut>(
        self,
        name: &str,
        permission: Permission,
        f: F,
    ) -> xmn_protocol::Result<Self>
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: InvocationContext| -> HandlerFuture {
            Box::pin(f(ctx))
        });
        self.register(Registry::Api, name, permission, handler)
    }

    /// Registers a closure as an event handler.
    pub fn event_fn<F, Fut>(
        self,
        name: &str,
        permission: Permission,
        f: F,
    ) -> xmn_protocol::Result<Self>
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: InvocationContext| -> HandlerFuture {
            Box::pin(f(ctx))
        });
        self.register(Registry::Event, name, permission, handler)
    }

    fn register_provider<P: XmnProvider>(
        mut self,
        registry: Registry,
        name: &str,
        permission: Permission,
    ) -> xmn_protocol::Result<Self> {
        if !P::EXPORTS.contains(&name) {
            return Err(ProtocolError::MissingHandler {
                name: name.to_string(),
                provider: P::NAME.to_string(),
            });
        }

        self.providers
            .entry(P::NAME)
            .or_insert_with(|| (P::EXPORTS, BTreeSet::new()))
            .1
            .insert(name.to_string());

        let handler: Handler = Arc::new(|ctx: InvocationContext| P::create().call(ctx));
        self.register(registry, name, permission, handler)
    }

    fn register(
        mut self,
        registry: Registry,
        name: &str,
        permission: Permission,
        handler: Handler,
    ) -> xmn_protocol::Result<Self> {
        let table = match registry {
            Registry::Api => &mut self.apis,
            Registry::Event => &mut self.events,
        };
        if table.contains_key(name) {
            return Err(ProtocolError::DuplicateRegistration(format!(
                "{} {}",
                registry.as_str(),
                name
            )));
        }

        debug!(name, kind = registry.as_str(), %permission, "Registered handler");
        table.insert(
            name.to_string(),
            Registration {
                handler,
                permission,
            },
        );
        Ok(self)
    }

    /// Finishes registration, warning about provider exports never registered.
    pub fn build(self) -> Router {
        for (provider, (exports, used)) in &self.providers {
            for export in exports.iter().filter(|e| !used.contains(**e)) {
                warn!("{}.{} is not used, please remove", provider, export);
            }
        }

        Router {
            inner: Arc::new(RouterInner {
                apis: self.apis,
                events: self.events,
            }),
        }
    }
}

struct RouterInner {
    apis: HashMap<String, Registration>,
    events: HashMap<String, Registration>,
}

/// Immutable handler tables shared by every connection of an endpoint.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut apis: Vec<&String> = self.inner.apis.keys().collect();
        let mut events: Vec<&String> = self.inner.events.keys().collect();
        apis.sort();
        events.sort();
        f.debug_struct("Router")
            .field("apis", &apis)
            .field("events", &events)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        RouterBuilder::new().build()
    }
}

impl Router {
    /// Starts a new builder.
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Whether a request handler is registered under `name`.
    pub fn has_api(&self, name: &str) -> bool {
        self.inner.apis.contains_key(name)
    }

    /// Whether an event handler is registered under `name`.
    pub fn has_event(&self, name: &str) -> bool {
        self.inner.events.contains_key(name)
    }

    fn prepare(
        &self,
        registry: Registry,
        ci: &ConnectionInfo,
        name: String,
        peer_ts: u64,
        params: Payload,
    ) -> Result<(Handler, InvocationContext), RouterError> {
        let table = match registry {
            Registry::Api => &self.inner.apis,
            Registry::Event => &self.inner.events,
        };

        let Some(registration) = table.get(&name) else {
            return Err(match registry {
                Registry::Api => RouterError::UnknownApi(name),
                Registry::Event => RouterError::UnknownEvent(name),
            });
        };

        if !ci.permission.allows(registration.permission) {
            return Err(RouterError::PermissionDenied {
                name,
                required: registration.permission,
                granted: ci.permission,
            });
        }

        let ctx = InvocationContext {
            name,
            ts: ci.local_ts(peer_ts),
            connection_id: ci.id,
            permission: ci.permission,
            client_identity: ci.client_identity.clone(),
            params,
        };
        Ok((registration.handler.clone(), ctx))
    }

    /// Dispatches a request.
    ///
    /// The returned future owns everything it needs, so the caller can run it
    /// concurrently with further traffic on the connection. It always yields
    /// a response correlated by the request's `seq`.
    pub fn dispatch_request(
        &self,
        ci: &ConnectionInfo,
        request: WireRequest,
    ) -> impl Future<Output = WireObject> + Send + 'static {
        let WireRequest { api, seq, ts, data } = request;
        let prepared = self.prepare(Registry::Api, ci, api.clone(), ts, data);
        let connection_id = ci.id;

        async move {
            let result = match prepared {
                Ok((handler, ctx)) => invoke(handler, ctx).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    debug!(%connection_id, seq, api = %api, "Request handled");
                    WireObject::response(seq, value)
                }
                Err(e) => {
                    warn!(%connection_id, seq, api = %api, error = %e, "Request failed");
                    WireObject::error_response(seq, e.code(), e.message())
                }
            }
        }
    }

    /// Dispatches an event, applying the watermark.
    ///
    /// Events at or below the watermark are acknowledged without running the
    /// handler. The watermark advances only when the handler succeeds. An
    /// event response is produced in every case.
    pub async fn dispatch_event(&self, ci: &mut ConnectionInfo, event: WireEvent) -> WireObject {
        let WireEvent {
            name,
            event_ts,
            data,
        } = event;

        if !ci.accepts_event(event_ts) {
            debug!(
                connection_id = %ci.id,
                name = %name,
                event_ts,
                watermark = ci.last_event_ts,
                "Skipping stale event"
            );
            return WireObject::event_response(name, event_ts);
        }

        let result = match self.prepare(Registry::Event, ci, name.clone(), event_ts, data) {
            Ok((handler, ctx)) => invoke(handler, ctx).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {
                ci.advance_watermark(event_ts);
                debug!(connection_id = %ci.id, name = %name, event_ts, "Event handled");
                WireObject::event_response(name, event_ts)
            }
            Err(e) => {
                warn!(connection_id = %ci.id, name = %name, event_ts, error = %e, "Event failed");
                WireObject::event_error_response(name, event_ts, e.code(), e.message())
            }
        }
    }
}

async fn invoke(handler: Handler, ctx: InvocationContext) -> Result<Value, RouterError> {
    let name = ctx.name.clone();
    match AssertUnwindSafe(async move { handler(ctx).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RouterError::Handler(e)),
        Err(_) => Err(RouterError::Panicked(name)),
    }
}

/// Merges `fields` into the connection's client identity.
///
/// Returns the `upgrade_client_identity` system event to push to the peer if
/// anything changed.
pub fn upgrade_client_identity(
    ci: &mut ConnectionInfo,
    fields: ClientIdentity,
) -> Option<WireObject> {
    let identity = ci.merge_identity(fields)?;
    debug!(connection_id = %ci.id, fields = identity.len(), "Client identity upgraded");
    Some(WireObject::sys_event(
        sys_event::UPGRADE_CLIENT_IDENTITY,
        Value::Object(identity),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xmn_protocol::{IvMode, WireEventResponse, WireResponse};

    struct Accounts;

    impl XmnProvider for Accounts {
        const NAME: &'static str = "Accounts";
        const EXPORTS: &'static [&'static str] = &["getBalance", "closeAccount", "audit"];

        fn create() -> Self {
            Accounts
        }

        fn call(self, ctx: InvocationContext) -> HandlerFuture {
            let name = ctx.name.clone();
            match name.as_str() {
                "getBalance" => Box::pin(self.get_balance(ctx)),
                "closeAccount" => Box::pin(async { fail("Forbidden", "account is frozen") }),
                _ => Box::pin(async { ok(Value::Null) }),
            }
        }
    }

    impl Accounts {
        async fn get_balance(self, ctx: InvocationContext) -> HandlerResult {
            let params: Value = ctx.params_as()?;
            Ok(json!({"acct": params["acct"], "balance": 100}))
        }
    }

    fn ok(value: Value) -> HandlerResult {
        Ok(value)
    }

    fn fail(name: &str, message: &str) -> HandlerResult {
        Err(HandlerError::new(name, message))
    }

    async fn panicking(_ctx: InvocationContext) -> HandlerResult {
        panic!("handler bug");
    }

    fn conn(permission: Permission) -> ConnectionInfo {
        let mut ci = ConnectionInfo::client("test", None, true, IvMode::Random);
        ci.permission = permission;
        ci
    }

    fn request(api: &str, seq: u64) -> WireRequest {
        WireRequest {
            api: api.to_string(),
            seq,
            ts: 1_000,
            data: json!({"acct": 7}).into(),
        }
    }

    fn event(name: &str, event_ts: u64) -> WireEvent {
        WireEvent {
            name: name.to_string(),
            event_ts,
            data: Payload::empty_object(),
        }
    }

    fn as_response(obj: WireObject) -> WireResponse {
        match obj {
            WireObject::Response(r) => r,
            other => panic!("expected response, got {:?}", other),
        }
    }

    fn as_event_response(obj: WireObject) -> WireEventResponse {
        match obj {
            WireObject::EventResponse(r) => r,
            other => panic!("expected event response, got {:?}", other),
        }
    }

    fn test_router() -> Router {
        Router::builder()
            .api::<Accounts>("getBalance", Permission::Public)
            .unwrap()
            .api::<Accounts>("closeAccount", Permission::Public)
            .unwrap()
            .api_fn("adminOnly", Permission::Admin, |_ctx| async { ok(json!(true)) })
            .unwrap()
            .api_fn("panics", Permission::Public, panicking)
            .unwrap()
            .api_fn("echoTs", Permission::Public, |ctx| async move { ok(json!(ctx.ts)) })
            .unwrap()
            .event_fn("clicked", Permission::Public, |_ctx| async { ok(Value::Null) })
            .unwrap()
            .event_fn("failing", Permission::Public, |_ctx| async { fail("Error", "nope") })
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn test_dispatch_provider_request() {
        let router = test_router();
        let ci = conn(Permission::Public);

        let resp = as_response(router.dispatch_request(&ci, request("getBalance", 3)).await);
        assert_eq!(resp.seq, 3);
        assert_eq!(resp.error, None);
        assert_eq!(resp.data, Payload::Json(json!({"acct": 7, "balance": 100})));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_api() {
        let router = test_router();
        let ci = conn(Permission::Admin);

        let resp = as_response(router.dispatch_request(&ci, request("missing", 4)).await);
        assert_eq!(resp.seq, 4);
        assert_eq!(resp.error.as_deref(), Some("UnknownApi"));
        assert_eq!(resp.data, Payload::Json(json!("missing")));
    }

    #[tokio::test]
    async fn test_dispatch_handler_error() {
        let router = test_router();
        let ci = conn(Permission::Public);

        let resp = as_response(router.dispatch_request(&ci, request("closeAccount", 5)).await);
        assert_eq!(resp.error.as_deref(), Some("Forbidden"));
        assert_eq!(resp.data, Payload::Json(json!("account is frozen")));
    }

    #[tokio::test]
    async fn test_dispatch_permission_denied() {
        let router = test_router();

        let resp = as_response(
            router
                .dispatch_request(&conn(Permission::Session), request("adminOnly", 6))
                .await,
        );
        assert_eq!(resp.error.as_deref(), Some("PermissionDenied"));

        let resp = as_response(
            router
                .dispatch_request(&conn(Permission::Admin), request("adminOnly", 7))
                .await,
        );
        assert_eq!(resp.error, None);
    }

    #[tokio::test]
    async fn test_dispatch_panic_is_contained() {
        let router = test_router();
        let ci = conn(Permission::Public);

        let resp = as_response(router.dispatch_request(&ci, request("panics", 8)).await);
        assert_eq!(resp.error.as_deref(), Some("HandlerFault"));
    }

    #[tokio::test]
    async fn test_context_ts_includes_offset() {
        let router = test_router();
        let mut ci = conn(Permission::Public);
        ci.ms_offset = 250;

        let resp = as_response(router.dispatch_request(&ci, request("echoTs", 9)).await);
        assert_eq!(resp.data, Payload::Json(json!(1_250)));
    }

    #[tokio::test]
    async fn test_event_watermark() {
        let router = test_router();
        let mut ci = conn(Permission::Public);

        let first = as_event_response(router.dispatch_event(&mut ci, event("clicked", 100)).await);
        assert_eq!(first.seq, 100);
        assert_eq!(first.error, None);
        assert_eq!(ci.last_event_ts, 100);

        // Duplicate and older events are acknowledged, not re-run
        let dup = as_event_response(router.dispatch_event(&mut ci, event("clicked", 100)).await);
        assert_eq!(dup.seq, 100);
        assert_eq!(dup.error, None);
        let old = as_event_response(router.dispatch_event(&mut ci, event("failing", 50)).await);
        assert_eq!(old.error, None);
        assert_eq!(ci.last_event_ts, 100);
    }

    #[tokio::test]
    async fn test_event_failures_still_respond() {
        let router = test_router();
        let mut ci = conn(Permission::Public);

        let unknown = as_event_response(router.dispatch_event(&mut ci, event("nope", 10)).await);
        assert_eq!(unknown.error.as_deref(), Some("UnknownEvent"));
        assert_eq!(unknown.seq, 10);

        let failed = as_event_response(router.dispatch_event(&mut ci, event("failing", 11)).await);
        assert_eq!(failed.error.as_deref(), Some("Error"));
        assert_eq!(failed.data, Some(json!("nope")));

        // Failures do not advance the watermark
        assert_eq!(ci.last_event_ts, 0);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = Router::builder()
            .api_fn("a", Permission::Public, |_ctx| async { ok(Value::Null) })
            .unwrap()
            .api_fn("a", Permission::Public, |_ctx| async { ok(Value::Null) });
        assert!(matches!(result, Err(ProtocolError::DuplicateRegistration(_))));
    }

    #[test]
    fn test_same_name_in_both_registries_is_allowed() {
        let router = Router::builder()
            .api_fn("sync", Permission::Public, |_ctx| async { ok(Value::Null) })
            .unwrap()
            .event_fn("sync", Permission::Public, |_ctx| async { ok(Value::Null) })
            .unwrap()
            .build();
        assert!(router.has_api("sync"));
        assert!(router.has_event("sync"));
    }

    #[test]
    fn test_missing_provider_export_fails() {
        let result = Router::builder().api::<Accounts>("transfer", Permission::Session);
        match result {
            Err(ProtocolError::MissingHandler { name, provider }) => {
                assert_eq!(name, "transfer");
                assert_eq!(provider, "Accounts");
            }
            other => panic!("expected MissingHandler, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_upgrade_client_identity() {
        let mut ci = conn(Permission::Public);
        let mut fields = ClientIdentity::new();
        fields.insert("userId".to_string(), json!("u1"));

        let push = upgrade_client_identity(&mut ci, fields.clone()).unwrap();
        match push {
            WireObject::SysEvent(se) => {
                assert_eq!(se.name, sys_event::UPGRADE_CLIENT_IDENTITY);
                assert_eq!(se.data, Payload::Json(json!({"userId": "u1"})));
            }
            other => panic!("expected sys event, got {:?}", other),
        }

        // Unchanged fields push nothing
        assert!(upgrade_client_identity(&mut ci, fields).is_none());
    }

    #[test]
    fn test_handler_error_conversions() {
        let e: HandlerError = anyhow::anyhow!("disk full").into();
        assert_eq!(e.name, "Error");
        assert_eq!(e.message, "disk full");

        let e: HandlerError = ProtocolError::Timeout("slow".to_string()).into();
        assert_eq!(e.name, "Timeout");
    }
}
