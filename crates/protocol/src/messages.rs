//! Wire message definitions for XMN.
//!
//! Every body carries a list of [`WireObject`]s. Each object serializes to a
//! JSON object with a `type` discriminator:
//!
//! ```text
//! {"type":"request","api":..,"seq":..,"clientTs":..,"data":..}
//! {"type":"response","seq":..,"error":..,"data":..}
//! {"type":"event","name":..,"eventTs":..,"data":..}
//! {"type":"event_resp","name":..,"seq":..,"error":..}
//! {"type":"sys_event","name":..,"data":..}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Free-form client identity record, upgradeable mid-session.
pub type ClientIdentity = serde_json::Map<String, Value>;

/// Names of protocol control events.
pub mod sys_event {
    /// Idle probe sent by the keep-alive scheduler.
    pub const PING: &str = "ping";
    /// Server-driven transport reconfiguration, carries [`super::ProviderConfig`].
    pub const PROVIDER_CONFIG: &str = "provider_config";
    /// Client identity fields changed on the peer.
    pub const UPGRADE_CLIENT_IDENTITY: &str = "upgrade_client_identity";
    /// New sync key, carries [`super::RotateKey`].
    pub const ROTATE_KEY: &str = "rotate_key";
}

/// Payload of the `provider_config` system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Idle interval after which a ping is sent.
    #[serde(rename = "msPingInterval")]
    pub ms_ping_interval: u64,
}

/// Payload of the `rotate_key` system event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateKey {
    /// Base64 of the new key encrypted with the current key.
    pub key: String,
}

/// Message payload: JSON, or raw bytes delivered by a binary frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// JSON value.
    Json(Value),
    /// Raw bytes that followed the metadata line of a binary frame.
    Binary(Vec<u8>),
    /// No payload.
    #[default]
    Empty,
}

impl Payload {
    /// Empty JSON object, the payload of zero-payload messages.
    pub fn empty_object() -> Self {
        Payload::Json(Value::Object(serde_json::Map::new()))
    }

    /// Returns the JSON value, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a binary payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Converts into a JSON value; binary payloads become base64 strings.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Binary(bytes) => Value::String(BASE64.encode(bytes)),
            Payload::Empty => Value::Null,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Empty,
            value => Payload::Json(value),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Payload::Json(value) => value.serialize(serializer),
            Payload::Binary(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            Payload::Empty => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Payload::Empty),
            value => Ok(Payload::Json(value)),
        }
    }
}

/// A request expecting a correlated [`WireResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Api name.
    pub api: String,
    /// Per-connection sequence id, starting at 1.
    pub seq: u64,
    /// Client timestamp (ms since epoch) at issuance.
    #[serde(rename = "clientTs", default)]
    pub ts: u64,
    /// Request parameters.
    #[serde(default)]
    pub data: Payload,
}

/// Response correlated to a request by `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    /// Sequence id of the request being answered.
    pub seq: u64,
    /// Error code, `None` on success.
    pub error: Option<String>,
    /// Result payload, or the error message when `error` is set.
    #[serde(default)]
    pub data: Payload,
}

/// Fire-and-forget event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Event name.
    pub name: String,
    /// Event creation timestamp (ms since epoch), used for deduplication.
    #[serde(rename = "eventTs")]
    pub event_ts: u64,
    /// Event parameters.
    #[serde(default)]
    pub data: Payload,
}

/// Acknowledgement of an event, echoing its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEventResponse {
    /// Event name.
    pub name: String,
    /// Echoed event timestamp.
    pub seq: u64,
    /// Error code, `None` on success.
    pub error: Option<String>,
    /// Error message when `error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Protocol control event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSysEvent {
    /// One of the names in [`sys_event`].
    pub name: String,
    /// Control payload.
    #[serde(default)]
    pub data: Payload,
}

/// Closed set of messages exchanged over an XMN connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireObject {
    /// Request expecting a response.
    Request(WireRequest),
    /// Response to a request.
    Response(WireResponse),
    /// Fire-and-forget event.
    Event(WireEvent),
    /// Event acknowledgement.
    #[serde(rename = "event_resp")]
    EventResponse(WireEventResponse),
    /// Protocol control event.
    SysEvent(WireSysEvent),
}

impl WireObject {
    /// Creates a request.
    pub fn request(api: impl Into<String>, seq: u64, ts: u64, data: impl Into<Payload>) -> Self {
        WireObject::Request(WireRequest {
            api: api.into(),
            seq,
            ts,
            data: data.into(),
        })
    }

    /// Creates a successful response.
    pub fn response(seq: u64, data: impl Into<Payload>) -> Self {
        WireObject::Response(WireResponse {
            seq,
            error: None,
            data: data.into(),
        })
    }

    /// Creates an error response; the message travels in `data`.
    pub fn error_response(seq: u64, error: impl Into<String>, message: impl Into<String>) -> Self {
        WireObject::Response(WireResponse {
            seq,
            error: Some(error.into()),
            data: Payload::Json(Value::String(message.into())),
        })
    }

    /// Creates an event.
    pub fn event(name: impl Into<String>, event_ts: u64, data: impl Into<Payload>) -> Self {
        WireObject::Event(WireEvent {
            name: name.into(),
            event_ts,
            data: data.into(),
        })
    }

    /// Creates an event acknowledgement.
    pub fn event_response(name: impl Into<String>, seq: u64) -> Self {
        WireObject::EventResponse(WireEventResponse {
            name: name.into(),
            seq,
            error: None,
            data: None,
        })
    }

    /// Creates a failed event acknowledgement.
    pub fn event_error_response(
        name: impl Into<String>,
        seq: u64,
        error: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        WireObject::EventResponse(WireEventResponse {
            name: name.into(),
            seq,
            error: Some(error.into()),
            data: Some(Value::String(message.into())),
        })
    }

    /// Creates a system event.
    pub fn sys_event(name: impl Into<String>, data: impl Into<Payload>) -> Self {
        WireObject::SysEvent(WireSysEvent {
            name: name.into(),
            data: data.into(),
        })
    }

    /// Creates the zero-payload keep-alive probe.
    pub fn ping() -> Self {
        WireObject::sys_event(sys_event::PING, Payload::empty_object())
    }

    /// The `type` discriminator as written on the wire.
    pub fn wire_type(&self) -> &'static str {
        match self {
            WireObject::Request(_) => "request",
            WireObject::Response(_) => "response",
            WireObject::Event(_) => "event",
            WireObject::EventResponse(_) => "event_resp",
            WireObject::SysEvent(_) => "sys_event",
        }
    }

    /// Short label for logs: api or event name, or the sequence id.
    pub fn label(&self) -> String {
        match self {
            WireObject::Request(r) => r.api.clone(),
            WireObject::Response(r) => r.seq.to_string(),
            WireObject::Event(e) => e.name.clone(),
            WireObject::EventResponse(e) => e.name.clone(),
            WireObject::SysEvent(e) => e.name.clone(),
        }
    }

    /// Replaces the payload with raw bytes from a binary frame.
    ///
    /// Event responses carry no payload and are left untouched.
    pub fn attach_binary(&mut self, bytes: Vec<u8>) {
        match self {
            WireObject::Request(r) => r.data = Payload::Binary(bytes),
            WireObject::Response(r) => r.data = Payload::Binary(bytes),
            WireObject::Event(e) => e.data = Payload::Binary(bytes),
            WireObject::SysEvent(e) => e.data = Payload::Binary(bytes),
            WireObject::EventResponse(_) => {}
        }
    }

    /// Reconstructs a wire object from a parsed JSON element.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
