//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Default work factor for PBKDF2-HMAC-SHA256 key derivation.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Clone)]
pub struct CacheConfig {
    /// Memory budget in bytes (sum of encoded payload sizes)
    pub max_memory_bytes: usize,
    /// Maximum number of entries the cache can hold
    pub max_entries: usize,
    /// TTL applied to entries stored without an explicit TTL
    pub default_ttl: Duration,
    /// Upper bound for any entry TTL; also the grace period for retired keys
    pub max_ttl: Duration,
    /// Encoded payloads longer than this are LZ4 compressed
    pub compression_threshold: usize,
    /// Interval between background reaper passes
    pub reaper_interval: Duration,
    /// Maximum entries removed per lock acquisition during a reaper pass
    pub reaper_batch_size: usize,
    /// Age after which the active key is rotated
    pub key_rotation_interval: Duration,
    /// Number of encryptions after which the active key is rotated
    pub max_encryptions_per_key: u64,
    /// PBKDF2 iteration count, fixed for the lifetime of an instance
    pub kdf_iterations: u32,
    /// Memory usage percentage that triggers a `memory_pressure` event
    pub memory_pressure_threshold: f64,
    /// Master secret; a random one is generated when absent
    pub secret: Option<String>,
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("max_memory_bytes", &self.max_memory_bytes)
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .field("max_ttl", &self.max_ttl)
            .field("compression_threshold", &self.compression_threshold)
            .field("reaper_interval", &self.reaper_interval)
            .field("reaper_batch_size", &self.reaper_batch_size)
            .field("key_rotation_interval", &self.key_rotation_interval)
            .field("max_encryptions_per_key", &self.max_encryptions_per_key)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("memory_pressure_threshold", &self.memory_pressure_threshold)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_MAX_MEMORY_BYTES` - Memory budget (default: 64 MiB)
    /// - `CACHE_MAX_ENTRIES` - Maximum entries (default: 10000)
    /// - `CACHE_DEFAULT_TTL_MS` - Default TTL (default: 600000)
    /// - `CACHE_MAX_TTL_MS` - TTL ceiling (default: 86400000)
    /// - `CACHE_COMPRESSION_THRESHOLD` - Compression threshold in bytes (default: 1024)
    /// - `CACHE_REAPER_INTERVAL_MS` - Reaper frequency (default: 5000)
    /// - `CACHE_REAPER_BATCH_SIZE` - Entries per reaper batch (default: 256)
    /// - `CACHE_KEY_ROTATION_INTERVAL_MS` - Key lifetime (default: 3600000)
    /// - `CACHE_MAX_ENCRYPTIONS_PER_KEY` - Encryptions per key (default: 16777216)
    /// - `CACHE_KDF_ITERATIONS` - PBKDF2 iterations (default: 100000)
    /// - `CACHE_MEMORY_PRESSURE_THRESHOLD` - High-water mark in percent (default: 90)
    /// - `CACHE_SECRET` - Master secret (default: random per process)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_memory_bytes: env_or("CACHE_MAX_MEMORY_BYTES", defaults.max_memory_bytes),
            max_entries: env_or("CACHE_MAX_ENTRIES", defaults.max_entries),
            default_ttl: env_millis_or("CACHE_DEFAULT_TTL_MS", defaults.default_ttl),
            max_ttl: env_millis_or("CACHE_MAX_TTL_MS", defaults.max_ttl),
            compression_threshold: env_or(
                "CACHE_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            ),
            reaper_interval: env_millis_or("CACHE_REAPER_INTERVAL_MS", defaults.reaper_interval),
            reaper_batch_size: env_or("CACHE_REAPER_BATCH_SIZE", defaults.reaper_batch_size),
            key_rotation_interval: env_millis_or(
                "CACHE_KEY_ROTATION_INTERVAL_MS",
                defaults.key_rotation_interval,
            ),
            max_encryptions_per_key: env_or(
                "CACHE_MAX_ENCRYPTIONS_PER_KEY",
                defaults.max_encryptions_per_key,
            ),
            kdf_iterations: env_or("CACHE_KDF_ITERATIONS", defaults.kdf_iterations),
            memory_pressure_threshold: env_or(
                "CACHE_MEMORY_PRESSURE_THRESHOLD",
                defaults.memory_pressure_threshold,
            ),
            secret: env::var("CACHE_SECRET").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Checks that the configured values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_memory_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_entries == 0 {
            return Err(CacheError::InvalidConfig(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        if self.reaper_batch_size == 0 {
            return Err(CacheError::InvalidConfig(
                "reaper_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "reaper_interval must be greater than zero".to_string(),
            ));
        }
        if self.key_rotation_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "key_rotation_interval must be greater than zero".to_string(),
            ));
        }
        if self.kdf_iterations == 0 {
            return Err(CacheError::InvalidConfig(
                "kdf_iterations must be greater than zero".to_string(),
            ));
        }
        if self.max_encryptions_per_key == 0 {
            return Err(CacheError::InvalidConfig(
                "max_encryptions_per_key must be greater than zero".to_string(),
            ));
        }
        if self.default_ttl > self.max_ttl {
            return Err(CacheError::InvalidConfig(format!(
                "default_ttl ({:?}) exceeds max_ttl ({:?})",
                self.default_ttl, self.max_ttl
            )));
        }
        if !(self.memory_pressure_threshold > 0.0 && self.memory_pressure_threshold <= 100.0) {
            return Err(CacheError::InvalidConfig(
                "memory_pressure_threshold must be in (0, 100]".to_string(),
            ));
        }
        if let Some(secret) = &self.secret {
            if secret.len() < 16 {
                return Err(CacheError::InvalidConfig(
                    "secret must be at least 16 bytes".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_entries: 10_000,
            default_ttl: Duration::from_secs(600),
            max_ttl: Duration::from_secs(24 * 60 * 60),
            compression_threshold: 1024,
            reaper_interval: Duration::from_secs(5),
            reaper_batch_size: 256,
            key_rotation_interval: Duration::from_secs(60 * 60),
            max_encryptions_per_key: 1 << 24,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            memory_pressure_threshold: 90.0,
            secret: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
