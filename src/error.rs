//! Error types for the secure cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the secure cache.
///
/// A cache miss is not an error: lookups return `Ok(None)` for absent keys.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key is empty or exceeds the maximum key length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encoded value cannot fit in the memory budget even with the cache empty
    #[error("Value too large: {size} bytes exceeds memory budget of {budget} bytes")]
    ValueTooLarge { size: usize, budget: usize },

    /// Ciphertext or authentication tag did not verify
    #[error("Authentication failed for key: {0}")]
    AuthenticationFailed(String),

    /// Payload decrypted but could not be decompressed or deserialized
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// No key material is available for the requested version
    #[error("Key version {0} is not available for decryption")]
    KeyUnavailable(u32),

    /// Key derivation, random generation or cipher setup failed
    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    /// Value could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation attempted after shutdown
    #[error("Cache is closed")]
    CacheClosed,
}

impl CacheError {
    /// Returns true for errors that indicate tampering or corruption of stored data.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CacheError::AuthenticationFailed(_) | CacheError::CorruptPayload(_)
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the secure cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failure_classification() {
        assert!(CacheError::AuthenticationFailed("k".into()).is_integrity_failure());
        assert!(CacheError::CorruptPayload("bad lz4".into()).is_integrity_failure());
        assert!(!CacheError::CacheClosed.is_integrity_failure());
        assert!(!CacheError::ValueTooLarge { size: 10, budget: 5 }.is_integrity_failure());
    }

    #[test]
    fn test_error_messages() {
        let err = CacheError::ValueTooLarge {
            size: 2048,
            budget: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Value too large: 2048 bytes exceeds memory budget of 1024 bytes"
        );
        assert_eq!(CacheError::CacheClosed.to_string(), "Cache is closed");
    }
}
