//! Secure Cache - An encrypted in-process key-value cache
//!
//! Every value is AES-256-GCM encrypted at rest in memory, expires by TTL, and is
//! bounded by a memory budget enforced through LRU eviction. Large values are LZ4
//! compressed before sealing.

pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod global;
pub mod policy;
pub mod tasks;

pub use cache::{CacheStats, ReapReport, SecureCache, SetOptions};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use events::{CacheEvent, EventKind};
pub use policy::{AccessPolicy, RateLimitPolicy, SuspicionReason};
