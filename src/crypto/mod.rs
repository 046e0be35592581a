//! Encryption Module
//!
//! AES-256-GCM sealing of cache payloads with PBKDF2-HMAC-SHA256 derived keys
//! and versioned key rotation.
//!
//! # Features
//! - Fresh random nonce per seal, detached 16-byte authentication tag
//! - Versioned key material, zeroized on drop and never cloned
//! - Retired versions kept only while live entries still reference them

mod cipher;
mod keys;

pub use cipher::{CryptoBox, Sealed, NONCE_LEN, TAG_LEN};
pub use keys::{derive_key, KeyManager, KeyMaterial, PurgeReport, RotationPolicy, KEY_LEN, SALT_LEN};

use thiserror::Error;

use crate::error::CacheError;

/// Errors raised by the encryption layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("authentication verification failed")]
    AuthenticationFailed,

    #[error("random number generation failed")]
    RngFailure,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("key version {0} is not available")]
    KeyUnavailable(u32),

    #[error("key material has been released")]
    Released,
}

impl From<CryptoError> for CacheError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => {
                CacheError::AuthenticationFailed("<unattributed>".to_string())
            }
            CryptoError::KeyUnavailable(version) => CacheError::KeyUnavailable(version),
            CryptoError::Released => CacheError::CacheClosed,
            other => CacheError::Crypto(other.to_string()),
        }
    }
}

/// Builds the additional authenticated data binding a ciphertext to its cache key
/// and key version.
///
/// Format: `[key_version:u32 BE][key bytes]`
pub fn entry_aad(key: &str, key_version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + key.len());
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad.extend_from_slice(key.as_bytes());
    aad
}
