//! Body codec for XMN messages.
//!
//! # Body Format
//!
//! Each body consists of:
//! - 1 byte: leader (`J` plain JSON, `Z` deflated JSON, `B` binary frame)
//! - N bytes: payload encrypted with the connection's sync key
//!
//! The plaintext of a `J` body is a JSON array built by joining each object's
//! own serialization with `", "` inside brackets. Peers rely on this exact
//! form, so it is produced by hand rather than by serializing a `Vec`.
//!
//! # Compression
//!
//! Arrays longer than the compression threshold (1KB by default) are deflated
//! and sent as `Z`, but only when that is strictly smaller.
//!
//! # Binary Frames
//!
//! A `B` body decrypts to one object's JSON metadata, a `\n`, then raw bytes
//! that become the object's payload.

use flate2::{Decompress, FlushDecompress};
use serde::de::IgnoredAny;
use serde_json::{Map, Value};

use crate::compression::CompressionService;
use crate::crypto::KeyManager;
use crate::error::{ProtocolError, Result};
use crate::messages::WireObject;

/// Compression threshold in bytes. Larger arrays are considered for deflate.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum body size accepted on the wire and after inflation (16 MB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// One-byte body format discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Leader {
    /// Plain JSON array.
    Json = b'J',
    /// Deflated JSON array.
    DeflateJson = b'Z',
    /// Metadata line, newline, raw bytes.
    Binary = b'B',
}

impl Leader {
    /// Get the raw byte value.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a leader byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'J' => Ok(Leader::Json),
            b'Z' => Ok(Leader::DeflateJson),
            b'B' => Ok(Leader::Binary),
            other => Err(ProtocolError::InvalidLeader(other)),
        }
    }
}

/// When the encoder deflates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    /// Above the threshold, and only if the result is strictly smaller.
    #[default]
    Auto,
    /// Always deflate, regardless of size.
    Always,
    /// Never deflate.
    Never,
}

/// Joins each object's serialization with `", "` inside brackets.
pub fn stringify_wire_objects(objects: &[WireObject]) -> Result<String> {
    let parts = objects
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(format!("[{}]", parts.join(", ")))
}

/// Encoder and decoder for message bodies.
#[derive(Debug, Clone)]
pub struct BodyCodec {
    threshold: usize,
    policy: CompressionPolicy,
    compression: CompressionService,
}

impl BodyCodec {
    /// Create a codec with the given compression threshold.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            policy: CompressionPolicy::Auto,
            compression: CompressionService::new(),
        }
    }

    /// Set the compression policy.
    pub fn with_policy(mut self, policy: CompressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The compression threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encode a list of objects into an encrypted `J` or `Z` body.
    pub async fn encode(&self, keys: &mut KeyManager, objects: &[WireObject]) -> Result<Vec<u8>> {
        let json = stringify_wire_objects(objects)?;
        let json_len = json.len();
        let plain = json.into_bytes();

        let try_compress = match self.policy {
            CompressionPolicy::Auto => json_len > self.threshold,
            CompressionPolicy::Always => true,
            CompressionPolicy::Never => false,
        };

        let (leader, first_pass) = if try_compress {
            let deflated = self.compression.compress(plain.clone()).await?;
            if self.policy == CompressionPolicy::Always || deflated.len() < plain.len() {
                (Leader::DeflateJson, deflated)
            } else {
                (Leader::Json, plain)
            }
        } else {
            (Leader::Json, plain)
        };

        let encrypted = keys.encrypt(&first_pass)?;
        let mut out = Vec::with_capacity(1 + encrypted.len());
        out.push(leader.as_byte());
        out.extend_from_slice(&encrypted);

        tracing::debug!(
            first = %objects.first().map(WireObject::label).unwrap_or_default(),
            messages = objects.len(),
            json = json_len,
            wire = out.len(),
            compressed = leader == Leader::DeflateJson,
            "Encoded body"
        );
        Ok(out)
    }

    /// Encode one object with a raw byte payload into an encrypted `B` body.
    ///
    /// The object's own payload is dropped from the metadata line; `bytes`
    /// takes its place on decode.
    pub fn encode_binary(
        &self,
        keys: &mut KeyManager,
        object: &WireObject,
        bytes: &[u8],
    ) -> Result<Vec<u8>> {
        let mut meta = serde_json::to_value(object)?;
        if let Value::Object(map) = &mut meta {
            map.remove("data");
        }
        let meta = serde_json::to_vec(&meta)?;

        let mut plain = Vec::with_capacity(meta.len() + 1 + bytes.len());
        plain.extend_from_slice(&meta);
        plain.push(b'\n');
        plain.extend_from_slice(bytes);

        let encrypted = keys.encrypt(&plain)?;
        let mut out = Vec::with_capacity(1 + encrypted.len());
        out.push(Leader::Binary.as_byte());
        out.extend_from_slice(&encrypted);

        tracing::debug!(
            first = %object.label(),
            bytes = bytes.len(),
            wire = out.len(),
            "Encoded binary body"
        );
        Ok(out)
    }

    /// Decode an encrypted body into its objects.
    pub async fn decode(&self, keys: &mut KeyManager, data: &[u8]) -> Result<Vec<WireObject>> {
        let (&leader_byte, encrypted) = data
            .split_first()
            .ok_or_else(|| ProtocolError::Deserialization("empty body".to_string()))?;

        if data.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "body of {} bytes exceeds maximum {}",
                data.len(),
                MAX_BODY_SIZE
            )));
        }

        let leader = Leader::from_byte(leader_byte)?;
        let plain = keys.decrypt(encrypted, |plain| plausible_plaintext(leader, plain))?;

        let (objects, decoded_len) = match leader {
            Leader::Binary => {
                let newline = plain.iter().position(|&b| b == b'\n').ok_or_else(|| {
                    ProtocolError::Deserialization("binary frame without metadata line".to_string())
                })?;
                let meta: Value = serde_json::from_slice(&plain[..newline])?;
                let mut object = WireObject::from_value(meta)?;
                let bytes = plain[newline + 1..].to_vec();
                let len = bytes.len();
                object.attach_binary(bytes);
                (vec![object], len)
            }
            Leader::DeflateJson => {
                let inflated = self.compression.decompress(plain).await?;
                let len = inflated.len();
                (parse_wire_objects(&inflated)?, len)
            }
            Leader::Json => (parse_wire_objects(&plain)?, plain.len()),
        };

        tracing::debug!(
            first = %objects.first().map(WireObject::label).unwrap_or_default(),
            messages = objects.len(),
            wire = data.len(),
            message = decoded_len,
            leader = %char::from(leader.as_byte()),
            "Decoded body"
        );
        Ok(objects)
    }
}

impl Default for BodyCodec {
    fn default() -> Self {
        Self::new(COMPRESSION_THRESHOLD)
    }
}

/// Cheap shape check on a decrypted body, used to tell which key sealed it
/// while a rotation is settling.
fn plausible_plaintext(leader: Leader, plain: &[u8]) -> bool {
    match leader {
        Leader::Json => serde_json::from_slice::<IgnoredAny>(plain).is_ok(),
        Leader::Binary => plain
            .iter()
            .position(|&b| b == b'\n')
            .is_some_and(|newline| serde_json::from_slice::<Map<String, Value>>(&plain[..newline]).is_ok()),
        Leader::DeflateJson => {
            // Inflate only a short prefix; the full stream is handled off the loop.
            let mut prefix = [0u8; 64];
            let mut inflater = Decompress::new(true);
            if inflater
                .decompress(plain, &mut prefix, FlushDecompress::None)
                .is_err()
            {
                return false;
            }
            let produced = inflater.total_out() as usize;
            prefix[..produced]
                .iter()
                .find(|b| !b.is_ascii_whitespace())
                .is_some_and(|&b| b == b'[' || b == b'{')
        }
    }
}

/// Parses a JSON object or array of objects into wire objects.
fn parse_wire_objects(bytes: &[u8]) -> Result<Vec<WireObject>> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(items) => items.into_iter().map(WireObject::from_value).collect(),
        single => Ok(vec![WireObject::from_value(single)?]),
    }
}
