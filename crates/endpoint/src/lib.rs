//! # XMN Endpoint Library
//!
//! This crate provides both ends of an XMN connection: the per-connection
//! driver and its state, handler routing, and websocket client and server
//! endpoints built on [`xmn_protocol`].
//!
//! ## Overview
//!
//! - **Connection State**: keys, identity, clock offset and event watermark
//! - **Pending Registry**: sequence ids, queuing and completion of calls
//! - **Keep-Alive**: idle pings, reconfigurable by the server
//! - **Router**: provider registration, permission checks, dispatch
//! - **Driver**: one task per connection tying it all together
//! - **Endpoints**: [`XmnClient`] and [`XmnServer`] over websockets
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            XmnClient              XmnServer                 │
//! │                │              (ConnectionMap)               │
//! ├────────────────┴──────────────────────┴─────────────────────┤
//! │                    ConnectionDriver                         │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────────┐ │
//! │  │   Pending    │ │  Keep-Alive  │ │       Router         │ │
//! │  │   Registry   │ │              │ │                      │ │
//! │  └──────────────┘ └──────────────┘ └──────────────────────┘ │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │        BodyCodec + KeyManager (xmn-protocol)            ││
//! │  └─────────────────────────────────────────────────────────┘│
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Transport (websocket)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use xmn_endpoint::{Config, Permission, Router, XmnClient, XmnServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.init_tracing();
//!
//!     let router = Router::builder()
//!         .api_fn("echo", Permission::Public, |ctx| async move { Ok(ctx.params.into_json()) })?
//!         .build();
//!     let server = XmnServer::from_config(&config, router).await?;
//!     tokio::spawn(async move { server.serve().await });
//!
//!     let client = XmnClient::from_config(&config, Router::default())?;
//!     let reply = client.request("echo", json!({"hello": "world"})).await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`connection`]: Per-connection state and permissions
//! - [`pending`]: Outstanding calls
//! - [`keepalive`]: Idle ping scheduling
//! - [`network`]: Transport trait, websocket transport, handshake URLs
//! - [`router`]: Handler registration and dispatch
//! - [`driver`]: Per-connection event loop
//! - [`client`]: Client endpoint
//! - [`server`]: Server endpoint

pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
pub mod keepalive;
pub mod network;
pub mod pending;
pub mod router;
pub mod server;

// Re-export protocol for convenience
pub use xmn_protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export connection types for convenience
pub use connection::{ConnectionId, ConnectionInfo, Permission};

// Re-export driver types for convenience
pub use driver::{ConnectionDriver, ConnectionHandle, ConnectionSettings};

// Re-export router types for convenience
pub use router::{
    HandlerError, HandlerFuture, HandlerResult, InvocationContext, Router, RouterBuilder,
    RouterError, XmnProvider,
};

// Re-export network types for convenience
pub use network::{Transport, TransportEvent, TransportState, WebSocketTransport};

// Re-export endpoint types for convenience
pub use client::{ClientOptions, XmnClient};
pub use server::{ConnectionMap, ConnectionVerifier, DefaultVerifier, XmnServer};
