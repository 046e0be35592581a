//! Suspicious access detection
//!
//! The heuristic behind `suspicious_access` events is pluggable through
//! [`AccessPolicy`]. [`RateLimitPolicy`] is the default:
//! - more than 1000 reads of a single key within one second, hits and misses alike
//! - 3 or more integrity failures (any key) within sixty seconds
//!
//! Both limits are GCRA quotas from `governor`: a key may be read in a burst of up
//! to the window's allowance, which then refills evenly over the window.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Serialize;

/// Why an access was flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspicionReason {
    /// A single key was read unusually often
    HighRequestRate { count: u64, window_ms: u64 },
    /// A stored entry failed authentication or decoding
    IntegrityFailure { detail: String },
    /// Integrity failures are recurring across the cache
    RepeatedIntegrityFailures { count: u64, window_ms: u64 },
}

// == Access Policy ==
/// Decides when access patterns warrant a `suspicious_access` event.
///
/// Called inside the cache's critical section; implementations must be cheap.
pub trait AccessPolicy: Send + 'static {
    /// Observes a read of `key`, whether it hit, missed or found an expired entry.
    fn on_read(&mut self, key: &str) -> Option<SuspicionReason>;

    /// Observes an authentication or decoding failure on `key`.
    fn on_integrity_failure(&mut self, key: &str) -> Option<SuspicionReason>;

    /// Forgets per-key state for a key that left the cache.
    fn on_removed(&mut self, _key: &str) {}

    /// Drops state older than the policy's windows.
    fn prune(&mut self) {}
}

/// Spreads `cells` over `window`, allowing all of them in one burst.
pub(crate) fn window_quota(window: Duration, cells: u32) -> Quota {
    let cells = NonZeroU32::new(cells).unwrap_or(NonZeroU32::MIN);
    let period = (window / cells.get()).max(Duration::from_nanos(1));
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(cells))
        .allow_burst(cells)
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

// == Rate Limit Policy ==
pub struct RateLimitPolicy {
    read_window: Duration,
    max_reads_per_window: u64,
    failure_window: Duration,
    max_failures_per_window: u64,
    reads: DefaultKeyedRateLimiter<String>,
    /// Keys already reported; re-armed once the key is admitted again
    flagged: HashSet<String>,
    /// `None` when every failure is over the limit
    failures: Option<DefaultDirectRateLimiter>,
    failure_streak: u64,
}

impl RateLimitPolicy {
    pub fn new(
        read_window: Duration,
        max_reads_per_window: u64,
        failure_window: Duration,
        max_failures_per_window: u64,
    ) -> Self {
        let reads = RateLimiter::keyed(window_quota(
            read_window,
            saturating_u32(max_reads_per_window),
        ));
        // The failure that reaches the limit is the first one refused
        let failures = (max_failures_per_window > 1).then(|| {
            RateLimiter::direct(window_quota(
                failure_window,
                saturating_u32(max_failures_per_window - 1),
            ))
        });

        Self {
            read_window,
            max_reads_per_window,
            failure_window,
            max_failures_per_window,
            reads,
            flagged: HashSet::new(),
            failures,
            failure_streak: 0,
        }
    }

    /// Number of keys whose read quota is partly spent
    pub fn tracked_keys(&self) -> usize {
        self.reads.len()
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1000, Duration::from_secs(60), 3)
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("read_window", &self.read_window)
            .field("max_reads_per_window", &self.max_reads_per_window)
            .field("failure_window", &self.failure_window)
            .field("max_failures_per_window", &self.max_failures_per_window)
            .field("tracked_keys", &self.reads.len())
            .field("flagged", &self.flagged.len())
            .finish()
    }
}

impl AccessPolicy for RateLimitPolicy {
    fn on_read(&mut self, key: &str) -> Option<SuspicionReason> {
        let key = key.to_string();
        if self.reads.check_key(&key).is_ok() {
            self.flagged.remove(&key);
            return None;
        }

        // Report once, on the first read over the limit
        self.flagged
            .insert(key)
            .then(|| SuspicionReason::HighRequestRate {
                count: self.max_reads_per_window + 1,
                window_ms: self.read_window.as_millis() as u64,
            })
    }

    fn on_integrity_failure(&mut self, _key: &str) -> Option<SuspicionReason> {
        let admitted = match &self.failures {
            Some(limiter) => limiter.check().is_ok(),
            None => false,
        };
        if admitted {
            self.failure_streak = 0;
            return None;
        }

        self.failure_streak += 1;
        Some(SuspicionReason::RepeatedIntegrityFailures {
            count: self.max_failures_per_window.saturating_sub(1) + self.failure_streak,
            window_ms: self.failure_window.as_millis() as u64,
        })
    }

    fn on_removed(&mut self, key: &str) {
        self.flagged.remove(key);
    }

    fn prune(&mut self) {
        self.reads.retain_recent();
        self.flagged.clear();
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_under_limit_not_flagged() {
        let mut policy = RateLimitPolicy::new(Duration::from_secs(1), 5, Duration::from_secs(60), 3);
        for _ in 0..5 {
            assert!(policy.on_read("k").is_none());
        }
    }

    #[test]
    fn test_read_burst_flagged_once() {
        let mut policy = RateLimitPolicy::new(Duration::from_secs(60), 5, Duration::from_secs(60), 3);
        for _ in 0..5 {
            policy.on_read("k");
        }

        assert_eq!(
            policy.on_read("k"),
            Some(SuspicionReason::HighRequestRate {
                count: 6,
                window_ms: 60_000
            })
        );
        assert!(policy.on_read("k").is_none());
        // Other keys have their own quota
        assert!(policy.on_read("other").is_none());
    }

    #[test]
    fn test_read_quota_refills() {
        let mut policy =
            RateLimitPolicy::new(Duration::from_millis(100), 2, Duration::from_secs(60), 3);
        policy.on_read("k");
        policy.on_read("k");
        assert!(policy.on_read("k").is_some());

        std::thread::sleep(Duration::from_millis(150));
        assert!(policy.on_read("k").is_none());
        assert!(policy.on_read("k").is_none());
        // Admitted reads re-arm the report
        assert!(policy.on_read("k").is_some());
    }

    #[test]
    fn test_repeated_integrity_failures() {
        let mut policy = RateLimitPolicy::default();

        assert!(policy.on_integrity_failure("a").is_none());
        assert!(policy.on_integrity_failure("b").is_none());
        assert!(matches!(
            policy.on_integrity_failure("c"),
            Some(SuspicionReason::RepeatedIntegrityFailures { count: 3, .. })
        ));
        assert!(matches!(
            policy.on_integrity_failure("d"),
            Some(SuspicionReason::RepeatedIntegrityFailures { count: 4, .. })
        ));
    }

    #[test]
    fn test_integrity_failures_age_out() {
        let mut policy =
            RateLimitPolicy::new(Duration::from_secs(1), 1000, Duration::from_millis(100), 3);
        policy.on_integrity_failure("a");
        policy.on_integrity_failure("b");

        std::thread::sleep(Duration::from_millis(150));
        assert!(policy.on_integrity_failure("c").is_none());
    }

    #[test]
    fn test_single_failure_limit_reports_every_failure() {
        let mut policy = RateLimitPolicy::new(Duration::from_secs(1), 1000, Duration::from_secs(60), 1);
        assert!(matches!(
            policy.on_integrity_failure("a"),
            Some(SuspicionReason::RepeatedIntegrityFailures { count: 1, .. })
        ));
    }

    #[test]
    fn test_removed_rearms_and_prune_releases_state() {
        let mut policy = RateLimitPolicy::new(Duration::from_secs(60), 1, Duration::from_secs(60), 3);
        policy.on_read("a");
        assert!(policy.on_read("a").is_some());
        assert!(policy.on_read("a").is_none());

        policy.on_removed("a");
        assert!(policy.on_read("a").is_some());

        let mut policy =
            RateLimitPolicy::new(Duration::from_millis(20), 10, Duration::from_secs(60), 3);
        policy.on_read("a");
        policy.on_read("b");
        assert_eq!(policy.tracked_keys(), 2);

        std::thread::sleep(Duration::from_millis(50));
        policy.prune();
        assert_eq!(policy.tracked_keys(), 0);
    }
}
