//! Eviction Module
//!
//! Enforces the memory budget and entry ceiling by evicting least recently used
//! entries, and watches for memory pressure.

use std::fmt;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, RateLimiter};

use crate::cache::{EntryStore, MemoryUsage};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, PressureTrigger};
use crate::policy::window_quota;

// == Eviction Controller ==
#[derive(Debug, Clone, Copy)]
pub struct EvictionController {
    budget: usize,
    max_entries: usize,
}

impl EvictionController {
    pub fn new(budget: usize, max_entries: usize) -> Self {
        Self {
            budget,
            max_entries,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    // == Admit ==
    /// Rejects a payload that could not fit even in an empty cache.
    pub fn admit(&self, size: usize) -> Result<()> {
        if size > self.budget {
            return Err(CacheError::ValueTooLarge {
                size,
                budget: self.budget,
            });
        }
        Ok(())
    }

    fn over_limit(&self, store: &EntryStore) -> bool {
        store.total_size() > self.budget || store.len() > self.max_entries
    }

    // == Enforce ==
    /// Evicts oldest entries until the store is within budget.
    ///
    /// Returns the evicted keys in eviction order.
    pub fn enforce(&self, store: &mut EntryStore) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.over_limit(store) {
            match store.evict_oldest() {
                Some(entry) => evicted.push(entry.key),
                None => break,
            }
        }
        evicted
    }
}

// == Pressure Monitor ==
/// Edge-triggered detector for `memory_pressure`.
///
/// Fires when usage rises to the high-water mark (re-armed once usage drops back
/// below it), or when evictions inside one window reach the burst threshold. The
/// burst window is a `governor` quota of `threshold - 1` evictions per window, so
/// the eviction that reaches the threshold is the first one refused.
pub struct PressureMonitor {
    high_water: f64,
    above_high_water: bool,
    burst_threshold: u64,
    /// `None` when a single eviction already counts as a burst
    burst_limiter: Option<DefaultDirectRateLimiter>,
    burst_reported: bool,
}

impl PressureMonitor {
    /// Default burst detection: 32 evictions within one second
    pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(1);
    pub const DEFAULT_BURST_THRESHOLD: u64 = 32;

    pub fn new(high_water: f64, burst_window: Duration, burst_threshold: u64) -> Self {
        let burst_limiter = (burst_threshold > 1).then(|| {
            let allowance = u32::try_from(burst_threshold - 1).unwrap_or(u32::MAX);
            RateLimiter::direct(window_quota(burst_window, allowance))
        });
        Self {
            high_water,
            above_high_water: false,
            burst_threshold,
            burst_limiter,
            burst_reported: false,
        }
    }

    /// Spends one quota cell per eviction; true once the window is exhausted.
    fn burst_exceeded(&mut self, evicted: u64) -> bool {
        let Some(limiter) = &self.burst_limiter else {
            if evicted == 0 {
                self.burst_reported = false;
            }
            return evicted > 0;
        };
        for _ in 0..evicted {
            if limiter.check().is_err() {
                return true;
            }
            // Room in the window again: the next burst may be reported
            self.burst_reported = false;
        }
        false
    }

    // == Observe ==
    /// Records the outcome of one admission and returns an event when pressure begins.
    pub fn observe(&mut self, usage: MemoryUsage, evicted: u64) -> Option<CacheEvent> {
        let burst = self.burst_exceeded(evicted);

        let crossed = usage.percentage >= self.high_water;
        let trigger = if crossed && !self.above_high_water {
            Some(PressureTrigger::HighWaterMark)
        } else if burst && !self.burst_reported {
            Some(PressureTrigger::EvictionBurst)
        } else {
            None
        };

        self.above_high_water = crossed;
        if trigger == Some(PressureTrigger::EvictionBurst) {
            self.burst_reported = true;
        }

        let recent_evictions = if burst { self.burst_threshold } else { evicted };
        trigger.map(|trigger| CacheEvent::MemoryPressure {
            trigger,
            percentage: usage.percentage,
            used: usage.used,
            limit: usage.limit,
            recent_evictions,
        })
    }

    /// Re-arms the high-water trigger, e.g. after the cache is cleared.
    pub fn reset(&mut self) {
        self.above_high_water = false;
    }
}

impl fmt::Debug for PressureMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureMonitor")
            .field("high_water", &self.high_water)
            .field("above_high_water", &self.above_high_water)
            .field("burst_threshold", &self.burst_threshold)
            .field("burst_reported", &self.burst_reported)
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::crypto::{Sealed, NONCE_LEN, TAG_LEN};

    fn put(store: &mut EntryStore, key: &str, size: usize) {
        store.put(CacheEntry::new(
            key.to_string(),
            Sealed {
                ciphertext: vec![0u8; size],
                nonce: [0u8; NONCE_LEN],
                tag: [0u8; TAG_LEN],
            },
            1,
            false,
            size,
            None,
        ));
    }

    #[test]
    fn test_admit_rejects_oversized_value() {
        let controller = EvictionController::new(100, 10);
        assert!(controller.admit(100).is_ok());
        assert!(matches!(
            controller.admit(101),
            Err(CacheError::ValueTooLarge {
                size: 101,
                budget: 100
            })
        ));
    }

    #[test]
    fn test_enforce_evicts_lru_until_within_budget() {
        let controller = EvictionController::new(30, 100);
        let mut store = EntryStore::new();
        put(&mut store, "a", 10);
        put(&mut store, "b", 10);
        put(&mut store, "c", 10);
        store.touch("a");
        put(&mut store, "d", 15);

        let evicted = controller.enforce(&mut store);
        assert_eq!(evicted, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(store.total_size(), 25);
        assert!(store.contains_key("a"));
        assert!(store.contains_key("d"));
    }

    #[test]
    fn test_enforce_entry_ceiling() {
        let controller = EvictionController::new(1_000, 2);
        let mut store = EntryStore::new();
        put(&mut store, "a", 1);
        put(&mut store, "b", 1);
        put(&mut store, "c", 1);

        assert_eq!(controller.enforce(&mut store), vec!["a".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_enforce_noop_within_budget() {
        let controller = EvictionController::new(100, 10);
        let mut store = EntryStore::new();
        put(&mut store, "a", 50);
        assert!(controller.enforce(&mut store).is_empty());
    }

    #[test]
    fn test_high_water_is_edge_triggered() {
        let mut monitor = PressureMonitor::new(90.0, Duration::from_secs(1), 100);

        assert!(monitor.observe(MemoryUsage::new(50, 100), 0).is_none());
        let event = monitor.observe(MemoryUsage::new(95, 100), 0).unwrap();
        assert!(matches!(
            event,
            CacheEvent::MemoryPressure {
                trigger: PressureTrigger::HighWaterMark,
                ..
            }
        ));
        // Still above: no repeat
        assert!(monitor.observe(MemoryUsage::new(97, 100), 0).is_none());
        // Drop below re-arms
        assert!(monitor.observe(MemoryUsage::new(10, 100), 0).is_none());
        assert!(monitor.observe(MemoryUsage::new(92, 100), 0).is_some());
    }

    #[test]
    fn test_eviction_burst() {
        let mut monitor = PressureMonitor::new(100.0, Duration::from_millis(200), 3);

        assert!(monitor.observe(MemoryUsage::new(10, 100), 1).is_none());
        assert!(monitor.observe(MemoryUsage::new(10, 100), 1).is_none());
        let event = monitor.observe(MemoryUsage::new(10, 100), 1).unwrap();
        assert!(matches!(
            event,
            CacheEvent::MemoryPressure {
                trigger: PressureTrigger::EvictionBurst,
                recent_evictions: 3,
                ..
            }
        ));
        // Reported once per window
        assert!(monitor.observe(MemoryUsage::new(10, 100), 1).is_none());

        std::thread::sleep(Duration::from_millis(250));
        assert!(monitor.observe(MemoryUsage::new(10, 100), 3).is_some());
    }

    #[test]
    fn test_eviction_burst_in_one_admission() {
        let mut monitor = PressureMonitor::new(100.0, Duration::from_secs(60), 4);
        assert!(matches!(
            monitor.observe(MemoryUsage::new(10, 100), 10),
            Some(CacheEvent::MemoryPressure {
                trigger: PressureTrigger::EvictionBurst,
                ..
            })
        ));

        let mut single = PressureMonitor::new(100.0, Duration::from_secs(60), 1);
        assert!(single.observe(MemoryUsage::new(10, 100), 0).is_none());
        assert!(single.observe(MemoryUsage::new(10, 100), 1).is_some());
    }
}
