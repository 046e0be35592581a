//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache instance is live.
//!
//! # Tasks
//! - TTL Reaper: removes expired entries in batches and performs key maintenance

mod reaper;

pub use reaper::{spawn_reaper_task, ReaperHandle};
