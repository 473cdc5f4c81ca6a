//! Asynchronous deflate/inflate service.
//!
//! Compression is CPU-bound, so it runs on tokio's blocking pool and the
//! connection's event loop only awaits the result. The stream format is zlib,
//! matching what browser peers produce with pako.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ProtocolError, Result};
use crate::framing::MAX_BODY_SIZE;

/// Deflate/inflate off the event loop.
#[derive(Debug, Clone, Copy)]
pub struct CompressionService {
    level: Compression,
    max_output: usize,
}

impl CompressionService {
    /// Creates a service with the default level and a 16 MiB inflate cap.
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
            max_output: MAX_BODY_SIZE,
        }
    }

    /// Overrides the maximum inflated size.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    /// Compresses `data` on the blocking pool.
    pub async fn compress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let level = self.level;
        tokio::task::spawn_blocking(move || deflate(&data, level))
            .await
            .map_err(|e| ProtocolError::Compression(format!("deflate task failed: {}", e)))?
    }

    /// Decompresses `data` on the blocking pool.
    pub async fn decompress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let max_output = self.max_output;
        tokio::task::spawn_blocking(move || inflate(&data, max_output))
            .await
            .map_err(|e| ProtocolError::Compression(format!("inflate task failed: {}", e)))?
    }
}

impl Default for CompressionService {
    fn default() -> Self {
        Self::new()
    }
}

fn deflate(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

fn inflate(data: &[u8], max_output: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // One byte past the cap tells an exactly-full stream from an oversized one.
    ZlibDecoder::new(data)
        .take(max_output as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    if out.len() > max_output {
        return Err(ProtocolError::Compression(format!(
            "inflated size exceeds maximum {}",
            max_output
        )));
    }
    Ok(out)
}
