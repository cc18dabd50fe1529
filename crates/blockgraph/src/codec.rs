//! Payload encoding
//!
//! Messages, reducer partials, broadcasts and snapshots cross process
//! boundaries as bytes. Values are encoded with bincode; snapshot bodies are
//! additionally zstd-compressed.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{BspError, Result};

/// Encode a value into a shareable byte buffer
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode a value previously produced by [`encode`]
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Encode and compress a snapshot body
pub fn encode_compressed<T: Serialize>(value: &T, level: i32) -> Result<Vec<u8>> {
    let raw = bincode::serialize(value)?;
    zstd::encode_all(raw.as_slice(), level).map_err(|e| BspError::Codec(e.to_string()))
}

/// Decompress and decode a snapshot body
pub fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let raw = zstd::decode_all(bytes).map_err(|e| BspError::Codec(e.to_string()))?;
    decode(&raw)
}
