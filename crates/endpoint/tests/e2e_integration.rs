//! End-to-end integration tests for XMN.
//!
//! These tests run a real server on a loopback port with real clients:
//! - Handshake and first-message delivery
//! - Request/response and error correlation
//! - Events, server pushes and system events
//! - Key rotation and identity upgrades

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use xmn_endpoint::{
    ClientOptions, ConnectionId, HandlerError, Permission, Router, XmnClient, XmnServer,
};
use xmn_protocol::{ClientIdentity, Payload, ProtocolError, ServerPrivateKey, ShortCode};

/// RSA generation is slow in debug builds; share one key.
fn server_key() -> &'static ServerPrivateKey {
    static KEY: OnceLock<ServerPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| ServerPrivateKey::generate(1024).unwrap())
}

fn ok(value: Value) -> Result<Value, HandlerError> {
    Ok(value)
}

fn server_router() -> Router {
    Router::builder()
        .api_fn("getBalance", Permission::Public, |ctx| async move {
            let params: Value = ctx.params_as()?;
            ok(json!({"acct": params["acct"], "balance": 100}))
        })
        .unwrap()
        .api_fn("echo", Permission::Public, |ctx| async move {
            ok(ctx.params.into_json())
        })
        .unwrap()
        .api_fn("whoami", Permission::Public, |ctx| async move {
            ok(Value::Object(ctx.client_identity))
        })
        .unwrap()
        .api_fn("permission", Permission::Public, |ctx| async move {
            ok(json!(ctx.permission.as_str()))
        })
        .unwrap()
        .api_fn("withdraw", Permission::Public, |_ctx| async move {
            Err::<Value, _>(HandlerError::new("InsufficientFunds", "balance too low"))
        })
        .unwrap()
        .api_fn("closeAccount", Permission::Session, |_ctx| async move {
            ok(json!(true))
        })
        .unwrap()
        .build()
}

async fn start_server(router: Router) -> (Arc<XmnServer>, u16) {
    start_configured_server(router, |server| server).await
}

async fn start_configured_server(
    router: Router,
    configure: impl FnOnce(XmnServer) -> XmnServer,
) -> (Arc<XmnServer>, u16) {
    let server = XmnServer::bind("127.0.0.1:0", server_key().clone(), router)
        .await
        .unwrap();
    let server = Arc::new(configure(server));
    let port = server.local_addr().unwrap().port();

    let serving = server.clone();
    tokio::spawn(async move { serving.serve().await });
    (server, port)
}

fn client_options(port: u16) -> ClientOptions {
    ClientOptions::new(
        "127.0.0.1",
        Some(port),
        ShortCode::new("TEST").unwrap(),
        "1.2.3".parse().unwrap(),
        server_key().public_key(),
    )
}

async fn wait_for_connection(server: &XmnServer) -> ConnectionId {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = server.connections().ids().first() {
                return *id;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection not registered")
}

fn identity(value: Value) -> ClientIdentity {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {}", other),
    }
}

// =============================================================================
// Request / Response
// =============================================================================

#[tokio::test]
async fn test_first_request_travels_in_handshake() {
    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());

    assert!(!client.is_connected().await);
    let result = client.request("getBalance", json!({"acct": 7})).await.unwrap();
    assert_eq!(result, Payload::Json(json!({"acct": 7, "balance": 100})));

    assert!(client.is_connected().await);
    wait_for_connection(&server).await;
    assert_eq!(server.connections().len(), 1);
}

#[tokio::test]
async fn test_sequential_and_concurrent_requests() {
    let (_server, port) = start_server(server_router()).await;
    let client = Arc::new(XmnClient::new(client_options(port), Router::default()));

    client.request("echo", json!("first")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.request("echo", json!({"i": i})).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), Payload::Json(json!({"i": i})));
    }
}

#[tokio::test]
async fn test_large_payload_roundtrip() {
    let (_server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!(null)).await.unwrap();

    let big = "xmn ".repeat(8 * 1024);
    let result = client.request("echo", json!({"text": big})).await.unwrap();
    assert_eq!(result, Payload::Json(json!({"text": big})));
}

#[tokio::test]
async fn test_unknown_api_is_correlated_error() {
    let (_server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());

    let result = client.request("noSuchApi", json!({})).await;
    assert_eq!(
        result,
        Err(ProtocolError::UnknownApi("noSuchApi".to_string()))
    );

    // The connection survives
    assert!(client.request("echo", json!(1)).await.is_ok());
}

#[tokio::test]
async fn test_handler_error_is_forwarded() {
    let (_server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());

    let result = client.request("withdraw", json!({})).await;
    assert_eq!(
        result,
        Err(ProtocolError::handler_fault("InsufficientFunds", "balance too low"))
    );
}

#[tokio::test]
async fn test_permission_denied_on_public_channel() {
    let (_server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());

    assert_eq!(
        client.request("permission", json!({})).await.unwrap(),
        Payload::Json(json!("public_encrypted"))
    );

    let result = client.request("closeAccount", json!({})).await;
    assert!(matches!(result, Err(ProtocolError::PermissionDenied(_))));
    assert!(client.request("echo", json!(2)).await.is_ok());
}

#[tokio::test]
async fn test_private_channel_gets_session() {
    let (_server, port) = start_server(server_router()).await;
    let mut options = client_options(port);
    options.public = false;
    let client = XmnClient::new(options, Router::default());

    assert_eq!(
        client.request("closeAccount", json!({})).await.unwrap(),
        Payload::Json(json!(true))
    );
}

// =============================================================================
// Handshake Failures
// =============================================================================

#[tokio::test]
async fn test_wrong_server_key_is_refused() {
    let (server, port) = start_server(server_router()).await;
    let mut options = client_options(port);
    options.server_public_key = ServerPrivateKey::generate(1024).unwrap().public_key();
    let client = XmnClient::new(options, Router::default());

    let result = client.request("echo", json!({})).await;
    assert_eq!(result, Err(ProtocolError::NotConnected));
    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn test_malformed_handshake_path_is_refused() {
    let (server, port) = start_server(server_router()).await;

    let url = format!("ws://127.0.0.1:{}/internal/AAAA/AAAA", port);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    let url = format!("ws://127.0.0.1:{}/public/AAAA/", port);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn test_verifier_rejection_closes_connection() {
    struct RejectAll;

    impl xmn_endpoint::ConnectionVerifier for RejectAll {
        fn verify<'a>(
            &'a self,
            _ci: &'a xmn_endpoint::ConnectionInfo,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<Permission>> + Send + 'a>>
        {
            Box::pin(async { None })
        }
    }

    let (server, port) =
        start_configured_server(server_router(), |server| server.with_verifier(RejectAll)).await;
    let client = XmnClient::new(client_options(port), Router::default());

    let result = timeout(Duration::from_secs(5), client.request("echo", json!({})))
        .await
        .unwrap();
    assert_eq!(result, Err(ProtocolError::NotConnected));
    assert!(server.connections().is_empty());
}

// =============================================================================
// Events and Server Pushes
// =============================================================================

#[tokio::test]
async fn test_client_events_arrive_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let router = Router::builder()
        .event_fn("clicked", Permission::Public, move |ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.params.into_json());
                ok(Value::Null)
            }
        })
        .unwrap()
        .build();
    let (_server, port) = start_server(router).await;
    let client = XmnClient::new(client_options(port), Router::default());

    for i in 0..5 {
        client.send_event("clicked", json!({"n": i})).await.unwrap();
    }

    for i in 0..5 {
        let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received, json!({"n": i}));
    }
}

#[tokio::test]
async fn test_server_pushes_to_client() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_router = Router::builder()
        .api_fn("ping", Permission::Public, |_ctx| async move { ok(json!("pong")) })
        .unwrap()
        .event_fn("news", Permission::Admin, move |ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.params.into_json());
                ok(Value::Null)
            }
        })
        .unwrap()
        .build();

    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), client_router);
    client.request("echo", json!({})).await.unwrap();
    let id = wait_for_connection(&server).await;

    let reply = server.request(&id, "ping", json!({})).await.unwrap();
    assert_eq!(reply, Payload::Json(json!("pong")));

    server.send_event(&id, "news", json!({"headline": "hi"})).await.unwrap();
    let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, json!({"headline": "hi"}));
}

#[tokio::test]
async fn test_server_binary_push() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_router = Router::builder()
        .event_fn("upload", Permission::Public, move |ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ctx.params);
                ok(Value::Null)
            }
        })
        .unwrap()
        .build();

    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), client_router);
    client.request("echo", json!({})).await.unwrap();
    let id = wait_for_connection(&server).await;

    let object = xmn_protocol::WireObject::event("upload", xmn_protocol::now_millis(), Payload::Empty);
    server.send_binary(&id, object, vec![1, 2, 3, 255]).await.unwrap();

    let received = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Payload::Binary(vec![1, 2, 3, 255]));
}

#[tokio::test]
async fn test_provider_config_push_keeps_connection_alive() {
    let (_server, port) =
        start_configured_server(server_router(), |server| server.with_provider_ping_interval(100))
            .await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!({})).await.unwrap();

    // Several ping intervals pass with no application traffic
    sleep(Duration::from_millis(500)).await;

    assert!(client.is_connected().await);
    assert!(client.request("echo", json!("after pings")).await.is_ok());
}

// =============================================================================
// Keys and Identity
// =============================================================================

#[tokio::test]
async fn test_server_rotates_key() {
    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!({})).await.unwrap();
    let id = wait_for_connection(&server).await;

    server.rotate_key(&id).await.unwrap();
    assert_eq!(
        client.request("echo", json!("rotated")).await.unwrap(),
        Payload::Json(json!("rotated"))
    );

    server.rotate_key(&id).await.unwrap();
    assert!(client.request("echo", json!("twice")).await.is_ok());
}

#[tokio::test]
async fn test_client_rotates_key() {
    let (_server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!({})).await.unwrap();

    client.rotate_key().await.unwrap();
    assert_eq!(
        client.request("echo", json!("rotated")).await.unwrap(),
        Payload::Json(json!("rotated"))
    );
}

#[tokio::test]
async fn test_identity_in_handshake_and_upgrade() {
    let (_server, port) = start_server(server_router()).await;
    let mut options = client_options(port);
    options.client_identity = identity(json!({"deviceId": "d1"}));
    let client = XmnClient::new(options, Router::default());

    assert_eq!(
        client.request("whoami", json!({})).await.unwrap(),
        Payload::Json(json!({"deviceId": "d1"}))
    );

    let changed = client
        .upgrade_client_identity(identity(json!({"userId": "u1"})))
        .await
        .unwrap();
    assert!(changed);

    assert_eq!(
        client.request("whoami", json!({})).await.unwrap(),
        Payload::Json(json!({"deviceId": "d1", "userId": "u1"}))
    );
}

#[tokio::test]
async fn test_server_upgrades_identity() {
    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!({})).await.unwrap();
    let id = wait_for_connection(&server).await;

    let fields = identity(json!({"role": "teller"}));
    assert!(server.upgrade_client_identity(&id, fields.clone()).await.unwrap());
    assert!(!server.upgrade_client_identity(&id, fields).await.unwrap());

    assert_eq!(
        client.request("whoami", json!({})).await.unwrap(),
        Payload::Json(json!({"role": "teller"}))
    );
    assert_eq!(client.client_identity().await["role"], json!("teller"));

    // A fresh handshake carries the pushed identity
    client.close().await;
    assert_eq!(
        client.request("whoami", json!({})).await.unwrap(),
        Payload::Json(json!({"role": "teller"}))
    );
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_server_close_fails_client_calls_and_reconnects() {
    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!({})).await.unwrap();
    let id = wait_for_connection(&server).await;
    let first = client.connection_id().await;

    server.close(&id).await;
    timeout(Duration::from_secs(5), async {
        while client.is_connected().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The next call opens a fresh connection
    assert!(client.request("echo", json!("again")).await.is_ok());
    assert!(client.connection_id().await.is_some());
    assert_ne!(client.connection_id().await, first);
}

#[tokio::test]
async fn test_shutdown_removes_connections() {
    let (server, port) = start_server(server_router()).await;
    let client = XmnClient::new(client_options(port), Router::default());
    client.request("echo", json!({})).await.unwrap();
    wait_for_connection(&server).await;

    server.shutdown();
    timeout(Duration::from_secs(5), async {
        while !server.connections().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
