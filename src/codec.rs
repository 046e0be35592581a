//! Value codec
//!
//! Serializes cache values to canonical JSON bytes and LZ4-compresses payloads above
//! a size threshold. Decompression is guarded against bombs:
//! - 512MB ceiling on the declared decompressed size
//! - 1000x maximum compression ratio

use serde_json::Value;
use zeroize::Zeroizing;

use crate::error::{CacheError, Result};

const MAX_DECOMPRESSED_SIZE: usize = 512 * 1024 * 1024;
/// Uses u64 for integer-only ratio arithmetic
const MAX_COMPRESSION_RATIO: u64 = 1000;
/// `lz4_flex` prepends the decompressed length as a little-endian u32
const SIZE_PREFIX_LEN: usize = 4;

/// Encoded value ready for sealing.
///
/// The buffer holds plaintext and is zeroized on drop.
pub struct Encoded {
    pub bytes: Zeroizing<Vec<u8>>,
    pub compressed: bool,
}

impl std::fmt::Debug for Encoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoded")
            .field("len", &self.bytes.len())
            .field("compressed", &self.compressed)
            .finish()
    }
}

impl Encoded {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// == Codec ==
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    compression_threshold: usize,
}

impl Codec {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    // == Encode ==
    /// Serializes `value` and compresses it when warranted.
    ///
    /// `force` overrides the threshold: `Some(true)` always compresses,
    /// `Some(false)` never does, `None` compresses only above the threshold.
    pub fn encode(&self, value: &Value, force: Option<bool>) -> Result<Encoded> {
        let raw = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?,
        );

        let compress = force.unwrap_or(raw.len() > self.compression_threshold);
        if !compress {
            return Ok(Encoded {
                bytes: raw,
                compressed: false,
            });
        }

        if raw.len() > MAX_DECOMPRESSED_SIZE {
            return Err(CacheError::Serialization(format!(
                "value of {} bytes exceeds the {} byte compression limit",
                raw.len(),
                MAX_DECOMPRESSED_SIZE
            )));
        }

        Ok(Encoded {
            bytes: Zeroizing::new(lz4_flex::compress_prepend_size(&raw)),
            compressed: true,
        })
    }

    // == Decode ==
    /// Inverse of `encode`; fails with `CorruptPayload` on any malformed input.
    pub fn decode(&self, bytes: &[u8], compressed: bool) -> Result<Value> {
        if !compressed {
            return serde_json::from_slice(bytes)
                .map_err(|e| CacheError::CorruptPayload(format!("deserialization failed: {}", e)));
        }

        check_decompression_bounds(bytes)?;
        let raw = Zeroizing::new(
            lz4_flex::decompress_size_prepended(bytes)
                .map_err(|e| CacheError::CorruptPayload(format!("decompression failed: {}", e)))?,
        );

        serde_json::from_slice(&raw)
            .map_err(|e| CacheError::CorruptPayload(format!("deserialization failed: {}", e)))
    }
}

fn check_decompression_bounds(bytes: &[u8]) -> Result<()> {
    if bytes.len() < SIZE_PREFIX_LEN {
        return Err(CacheError::CorruptPayload(
            "compressed payload shorter than size prefix".to_string(),
        ));
    }

    let mut prefix = [0u8; SIZE_PREFIX_LEN];
    prefix.copy_from_slice(&bytes[..SIZE_PREFIX_LEN]);
    let declared = u32::from_le_bytes(prefix) as u64;

    if declared > MAX_DECOMPRESSED_SIZE as u64 {
        return Err(CacheError::CorruptPayload(
            "declared size exceeds decompression limit".to_string(),
        ));
    }

    let body = (bytes.len() - SIZE_PREFIX_LEN) as u64;
    let max_allowed = MAX_COMPRESSION_RATIO
        .checked_mul(body.max(1))
        .ok_or_else(|| CacheError::CorruptPayload("compression ratio overflow".to_string()))?;
    if declared > max_allowed {
        return Err(CacheError::CorruptPayload(
            "compression ratio exceeds safety limit".to_string(),
        ));
    }

    Ok(())
}
