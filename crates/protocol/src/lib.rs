//! # XMN Protocol Library
//!
//! This crate provides the wire format and cryptographic primitives of XMN,
//! the cross-machine messaging protocol: encrypted, compressible,
//! bidirectional requests, responses and events over a persistent
//! message-oriented socket.
//!
//! ## Overview
//!
//! The protocol crate is transport-agnostic and owns no connection state
//! beyond a connection's keys. It provides:
//!
//! - **Message Definitions**: the closed [`WireObject`] enum and its payloads
//! - **Sync Keys**: AES-256-CBC per-connection keys, RSA-OAEP key wrapping and rotation
//! - **Handshake Header**: short code, unique id, wrapped key and metadata
//! - **Body Codec**: leader byte, optional deflate, encryption, binary frames
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Wire Objects                   │  JSON, ", "-joined array
//! ├─────────────────────────────────────────┤
//! │          Compression                    │  zlib above 1KB, if smaller
//! ├─────────────────────────────────────────┤
//! │          Encryption                     │  AES-256-CBC, sync key
//! ├─────────────────────────────────────────┤
//! │          Leader byte                    │  J / Z / B
//! ├─────────────────────────────────────────┤
//! │      Transport (WebSocket message)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use xmn_protocol::{BodyCodec, IvMode, KeyManager, SyncKey, WireObject};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let key = SyncKey::generate();
//! let mut sender = KeyManager::with_key(key.clone(), IvMode::Random);
//! let mut receiver = KeyManager::with_key(key, IvMode::Random);
//!
//! let codec = BodyCodec::default();
//! let objects = vec![WireObject::request("getBalance", 1, 0, json!({"acct": 7}))];
//!
//! let body = codec.encode(&mut sender, &objects).await.unwrap();
//! assert_eq!(codec.decode(&mut receiver, &body).await.unwrap(), objects);
//! # });
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Sync keys, key manager and RSA key wrapping
//! - [`messages`]: Wire object definitions
//! - [`header`]: Handshake header codec
//! - [`framing`]: Body codec
//! - [`compression`]: Deflate service
//! - [`error`]: Error types

pub mod compression;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod header;
pub mod messages;

pub use compression::CompressionService;
pub use crypto::{
    IvMode, KeyManager, ServerPrivateKey, ServerPublicKey, SyncKey, DEFAULT_RSA_BITS, IV_LENGTH,
    SYNC_KEY_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use framing::{
    stringify_wire_objects, BodyCodec, CompressionPolicy, Leader, COMPRESSION_THRESHOLD,
    MAX_BODY_SIZE,
};
pub use header::{HandshakeHeader, HeaderCodec, HeaderInfo, ShortCode, UniqueId};
pub use messages::{
    now_millis, sys_event, ClientIdentity, Payload, ProviderConfig, RotateKey, WireEvent,
    WireEventResponse, WireObject, WireRequest, WireResponse, WireSysEvent,
};
