//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions, and
//! builds serializable snapshots of cache health.

use serde::Serialize;

// == Stats Collector ==
/// Monotonic counters for one cache instance.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    sets: u64,
    deletes: u64,
    auth_failures: u64,
    reencryptions: u64,
}

impl StatsCollector {
    // == Constructor ==
    /// Creates a new collector with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_evictions(&mut self, count: u64) {
        self.evictions += count;
    }

    pub fn record_expirations(&mut self, count: u64) {
        self.expirations += count;
    }

    pub fn record_set(&mut self) {
        self.sets += 1;
    }

    pub fn record_delete(&mut self) {
        self.deletes += 1;
    }

    pub fn record_auth_failure(&mut self) {
        self.auth_failures += 1;
    }

    pub fn record_reencryption(&mut self) {
        self.reencryptions += 1;
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // == Snapshot ==
    /// Combines the counters with the store's current footprint.
    pub fn snapshot(&self, footprint: Footprint) -> CacheStats {
        CacheStats {
            entry_count: footprint.entry_count,
            total_size: footprint.total_size,
            memory_usage: MemoryUsage::new(footprint.total_size, footprint.budget),
            hits: self.hits,
            misses: self.misses,
            hit_rate: self.hit_rate(),
            evictions: self.evictions,
            expirations: self.expirations,
            sets: self.sets,
            deletes: self.deletes,
            auth_failures: self.auth_failures,
            reencryptions: self.reencryptions,
            key_rotations: footprint.key_rotations,
            active_key_version: footprint.active_key_version,
            retained_key_versions: footprint.retained_key_versions,
        }
    }
}

/// Point-in-time store and key-manager figures fed into a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footprint {
    pub entry_count: usize,
    pub total_size: usize,
    pub budget: usize,
    pub key_rotations: u64,
    pub active_key_version: Option<u32>,
    pub retained_key_versions: usize,
}

// == Memory Usage ==
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    /// Bytes currently accounted to live entries
    pub used: usize,
    /// Configured memory budget
    pub limit: usize,
    /// `used / limit` in percent
    pub percentage: f64,
}

impl MemoryUsage {
    pub fn new(used: usize, limit: usize) -> Self {
        let percentage = if limit == 0 {
            0.0
        } else {
            used as f64 * 100.0 / limit as f64
        };
        Self {
            used,
            limit,
            percentage,
        }
    }
}

// == Cache Stats ==
/// Serializable snapshot of cache health.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Current number of live entries
    pub entry_count: usize,
    /// Sum of encoded payload sizes across live entries
    pub total_size: usize,
    pub memory_usage: MemoryUsage,
    /// Successful reads
    pub hits: u64,
    /// Reads of absent or expired keys
    pub misses: u64,
    pub hit_rate: f64,
    /// Entries removed to honour the memory budget or entry ceiling
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Reads rejected by ciphertext authentication or payload decoding
    pub auth_failures: u64,
    /// Entries re-encrypted under a newer key on read
    pub reencryptions: u64,
    pub key_rotations: u64,
    /// None once the cache has been shut down
    pub active_key_version: Option<u32>,
    /// Retired key versions still held for decryption
    pub retained_key_versions: usize,
}
