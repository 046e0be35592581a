//! Cache Entry Module
//!
//! Defines the encrypted representation of a single cached value with TTL and
//! access metadata.

use chrono::Utc;

use crate::crypto::{Sealed, NONCE_LEN, TAG_LEN};

// == Cache Entry ==
/// A single encrypted cache entry.
///
/// The plaintext value is never stored; only the AES-GCM ciphertext and the
/// material needed to open it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key this entry is stored under
    pub key: String,
    /// Encrypted, possibly compressed payload
    pub ciphertext: Vec<u8>,
    /// AES-GCM nonce used for this ciphertext
    pub nonce: [u8; NONCE_LEN],
    /// Detached AES-GCM authentication tag
    pub auth_tag: [u8; TAG_LEN],
    /// Key version that sealed this entry
    pub key_version: u32,
    /// Whether the payload was LZ4 compressed before sealing
    pub compressed: bool,
    /// Size of the encoded payload before encryption, used for memory accounting
    pub plaintext_size: usize,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
    /// Last successful read (Unix milliseconds)
    pub last_accessed_at: u64,
    /// Number of successful reads
    pub access_count: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry from a sealed payload with optional TTL.
    ///
    /// # Arguments
    /// * `key` - The cache key
    /// * `sealed` - Output of the crypto box
    /// * `key_version` - Version of the key that produced `sealed`
    /// * `compressed` - Whether the payload was compressed
    /// * `plaintext_size` - Encoded size before encryption
    /// * `ttl_ms` - Optional TTL in milliseconds
    pub fn new(
        key: String,
        sealed: Sealed,
        key_version: u32,
        compressed: bool,
        plaintext_size: usize,
        ttl_ms: Option<u64>,
    ) -> Self {
        let now = current_timestamp_ms();

        Self {
            key,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            auth_tag: sealed.tag,
            key_version,
            compressed,
            plaintext_size,
            created_at: now,
            expires_at: ttl_ms.map(|ttl| now.saturating_add(ttl)),
            last_accessed_at: now,
            access_count: 0,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now` (Unix milliseconds).
    ///
    /// Boundary condition: an entry is expired once `now >= expires_at`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    /// Checks if the entry has expired at the current time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    // == Record Access ==
    /// Updates access metadata after a successful read.
    pub fn record_access(&mut self, now: u64) {
        self.last_accessed_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    // == Reseal ==
    /// Replaces the ciphertext after re-encryption under a newer key.
    ///
    /// TTL, size and access metadata are preserved.
    pub fn reseal(&mut self, sealed: Sealed, key_version: u32) {
        self.ciphertext = sealed.ciphertext;
        self.nonce = sealed.nonce;
        self.auth_tag = sealed.tag;
        self.key_version = key_version;
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
