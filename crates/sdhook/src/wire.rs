//! Compressed JSON envelope for payloads crossing the command transport.
//!
//! Large values (job parameters, encoded images) travel as
//! `hex(zlib(compact JSON))` strings so the client can treat them as opaque text.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Serialize, de::DeserializeOwned};

/// Largest decompressed payload [`unpack`] accepts.
pub const MAX_UNPACKED_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to deserialize payload: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("Payload is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Failed to (de)compress payload: {0}")]
    Compression(#[from] std::io::Error),
    #[error("Payload inflates past {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Serialize `value` as compact JSON, deflate it and hex-encode the result.
pub fn pack<T: Serialize + ?Sized>(value: &T) -> Result<String, WireError> {
    let json = serde_json::to_vec(value).map_err(WireError::Serialize)?;
    let compressed = deflate(&json)?;
    tracing::trace!(
        json_size_bytes = json.len(),
        compressed_size_bytes = compressed.len(),
        "Packed payload"
    );
    Ok(hex::encode(compressed))
}

/// Inverse of [`pack`].
pub fn unpack<T: DeserializeOwned>(payload: &str) -> Result<T, WireError> {
    let compressed = hex::decode(payload.trim())?;
    let json = inflate(&compressed, MAX_UNPACKED_BYTES)?;
    serde_json::from_slice(&json).map_err(WireError::Deserialize)
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8], limit: u64) -> Result<Vec<u8>, WireError> {
    let mut decoder = ZlibDecoder::new(bytes).take(limit + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(WireError::TooLarge { limit });
    }
    Ok(out)
}
