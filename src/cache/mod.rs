//! Cache Module
//!
//! Provides the encrypted in-memory cache with TTL expiration and LRU eviction.

mod entry;
mod eviction;
mod lru;
mod secure;
mod stats;
mod store;


// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry};
pub use eviction::{EvictionController, PressureMonitor};
pub use lru::{LruList, NodeId};
pub use secure::{ReapReport, SecureCache, SetOptions, WeakSecureCache};
pub use stats::{CacheStats, Footprint, MemoryUsage, StatsCollector};
pub use store::EntryStore;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
