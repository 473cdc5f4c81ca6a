//! Handshake header codec.
//!
//! # Header Format
//!
//! ```text
//! [4 bytes short code][3 bytes unique id][wrapped sync key][encrypted metadata]
//! ```
//!
//! - Short code: up to 4 alphanumeric characters, each stored as its
//!   character code minus 40; unused trailing bytes are zero.
//! - Unique id: three bytes from a dotted `a.b.c` id, or an integer up to
//!   999999 split into base-100 digits.
//! - Wrapped sync key: RSA-OAEP/SHA-1 output, exactly the modulus length, so
//!   both sides split the variable sections without a length prefix.
//! - Metadata: the JSON object `{networkType, location, now, ...identity}`
//!   encrypted with the sync key.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::crypto::{IvMode, ServerPrivateKey, ServerPublicKey, SyncKey, IV_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::messages::ClientIdentity;

/// Length of the short code section.
pub const SHORT_CODE_LENGTH: usize = 4;

/// Length of the unique id section.
pub const UNIQUE_ID_LENGTH: usize = 3;

/// Offset subtracted from each short code character.
const SHORT_CODE_OFFSET: u8 = 40;

/// Largest integer accepted as a single-number unique id.
const MAX_NUMERIC_UNIQUE_ID: u32 = 999_999;

const KEY_NETWORK_TYPE: &str = "networkType";
const KEY_LOCATION: &str = "location";
const KEY_NOW: &str = "now";

/// Application short code, 1 to 4 ASCII alphanumeric characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShortCode(String);

impl ShortCode {
    /// Validates and wraps a short code.
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        if code.is_empty() || code.len() > SHORT_CODE_LENGTH {
            return Err(ProtocolError::InvalidShortCode(format!(
                "{:?} must be 1 to {} characters",
                code, SHORT_CODE_LENGTH
            )));
        }
        if !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtocolError::InvalidShortCode(format!(
                "{:?} must be alphanumeric",
                code
            )));
        }
        Ok(Self(code))
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encodes to the fixed 4-byte wire form.
    pub fn to_bytes(&self) -> [u8; SHORT_CODE_LENGTH] {
        let mut out = [0u8; SHORT_CODE_LENGTH];
        for (slot, b) in out.iter_mut().zip(self.0.bytes()) {
            *slot = b - SHORT_CODE_OFFSET;
        }
        out
    }

    /// Decodes the 4-byte wire form, ignoring zero padding.
    pub fn from_bytes(bytes: &[u8; SHORT_CODE_LENGTH]) -> Result<Self> {
        let code: String = bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b.wrapping_add(SHORT_CODE_OFFSET)))
            .collect();
        Self::new(code)
    }
}

impl FromStr for ShortCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Three-byte installation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; UNIQUE_ID_LENGTH]);

impl UniqueId {
    /// Creates a unique id from its three parts.
    pub fn from_parts(parts: [u8; UNIQUE_ID_LENGTH]) -> Self {
        Self(parts)
    }

    /// Returns the three parts.
    pub fn parts(&self) -> [u8; UNIQUE_ID_LENGTH] {
        self.0
    }
}

impl FromStr for UniqueId {
    type Err = ProtocolError;

    /// Parses `a.b.c` (each part 0..=255) or an integer up to 999999.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidUniqueId(format!("{:?}: {}", s, reason));

        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [single] => {
                let mut num: u32 = single
                    .trim()
                    .parse()
                    .map_err(|_| invalid("not a number"))?;
                if num > MAX_NUMERIC_UNIQUE_ID {
                    return Err(invalid("exceeds 999999"));
                }
                let c = (num % 100) as u8;
                num /= 100;
                let b = (num % 100) as u8;
                let a = (num / 100) as u8;
                Ok(Self([a, b, c]))
            }
            [a, b, c] => {
                let mut out = [0u8; UNIQUE_ID_LENGTH];
                for (slot, part) in out.iter_mut().zip([a, b, c]) {
                    *slot = part
                        .trim()
                        .parse()
                        .map_err(|_| invalid("each part must be 0..=255"))?;
                }
                Ok(Self(out))
            }
            _ => Err(invalid("expected three dotted parts")),
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Logical content of a handshake header.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderInfo {
    /// Application short code.
    pub short_code: ShortCode,
    /// Installation identifier.
    pub unique_id: UniqueId,
    /// Client network type (e.g. `wifi`).
    pub network_type: Option<String>,
    /// Coarse client location, free-form.
    pub location: Option<Value>,
    /// Client clock at encode time (ms since epoch).
    pub now: u64,
    /// Client identity fields, merged into the metadata object.
    pub client_identity: ClientIdentity,
}

impl HeaderInfo {
    /// Creates header info with no network type, location or identity.
    pub fn new(short_code: ShortCode, unique_id: UniqueId, now: u64) -> Self {
        Self {
            short_code,
            unique_id,
            network_type: None,
            location: None,
            now,
            client_identity: ClientIdentity::new(),
        }
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        if let Some(network_type) = &self.network_type {
            obj.insert(KEY_NETWORK_TYPE.to_string(), Value::String(network_type.clone()));
        }
        if let Some(location) = &self.location {
            obj.insert(KEY_LOCATION.to_string(), location.clone());
        }
        obj.insert(KEY_NOW.to_string(), Value::from(self.now));
        for (k, v) in &self.client_identity {
            obj.insert(k.clone(), v.clone());
        }
        obj
    }
}

/// A decoded handshake: header content plus the client's sync key.
#[derive(Debug, Clone)]
pub struct HandshakeHeader {
    /// Decoded header content.
    pub info: HeaderInfo,
    /// Sync key unwrapped with the server's private key.
    pub sync_key: SyncKey,
}

/// Encodes and decodes handshake headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderCodec {
    iv_mode: IvMode,
}

impl HeaderCodec {
    /// Creates a codec encrypting metadata with the given IV mode.
    pub fn new(iv_mode: IvMode) -> Self {
        Self { iv_mode }
    }

    /// Encodes a header for `key`, wrapped against the server's public key.
    pub fn encode(
        &self,
        info: &HeaderInfo,
        key: &SyncKey,
        server_key: &ServerPublicKey,
    ) -> Result<Vec<u8>> {
        let wrapped = server_key.wrap_key(key)?;
        let metadata = serde_json::to_vec(&info.metadata())?;
        let encrypted = key.encrypt(&metadata, self.iv_mode)?;

        let mut out = Vec::with_capacity(
            SHORT_CODE_LENGTH + UNIQUE_ID_LENGTH + wrapped.len() + encrypted.len(),
        );
        out.extend_from_slice(&info.short_code.to_bytes());
        out.extend_from_slice(&info.unique_id.parts());
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&encrypted);

        tracing::debug!(
            short_code = %info.short_code,
            unique_id = %info.unique_id,
            key = %key.fingerprint(),
            wire = out.len(),
            "Encoded handshake header"
        );
        Ok(out)
    }

    /// Decodes a header, unwrapping the sync key with the server's private key.
    pub fn decode(&self, data: &[u8], server_key: &ServerPrivateKey) -> Result<HandshakeHeader> {
        let wrapped_len = server_key.wrapped_key_len();
        let fixed = SHORT_CODE_LENGTH + UNIQUE_ID_LENGTH;
        if data.len() < fixed + wrapped_len + IV_LENGTH {
            return Err(ProtocolError::InvalidHeader(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }

        let mut code = [0u8; SHORT_CODE_LENGTH];
        code.copy_from_slice(&data[..SHORT_CODE_LENGTH]);
        let short_code = ShortCode::from_bytes(&code)?;

        let mut id = [0u8; UNIQUE_ID_LENGTH];
        id.copy_from_slice(&data[SHORT_CODE_LENGTH..fixed]);
        let unique_id = UniqueId::from_parts(id);

        let sync_key = server_key.unwrap_key(&data[fixed..fixed + wrapped_len])?;
        let plain = sync_key.decrypt(&data[fixed + wrapped_len..], self.iv_mode)?;

        let mut obj = match serde_json::from_slice::<Value>(&plain)? {
            Value::Object(obj) => obj,
            other => {
                return Err(ProtocolError::InvalidHeader(format!(
                    "metadata is not an object: {}",
                    other
                )))
            }
        };

        let now = obj
            .remove(KEY_NOW)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ProtocolError::InvalidHeader("metadata missing now".to_string()))?;
        let network_type = obj
            .remove(KEY_NETWORK_TYPE)
            .and_then(|v| v.as_str().map(str::to_string));
        let location = obj.remove(KEY_LOCATION).filter(|v| !v.is_null());

        Ok(HandshakeHeader {
            info: HeaderInfo {
                short_code,
                unique_id,
                network_type,
                location,
                now,
                client_identity: obj,
            },
            sync_key,
        })
    }
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new(IvMode::default())
    }
}
