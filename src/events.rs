//! Cache Events
//!
//! Publish/subscribe registry for cache health notifications.
//!
//! # Events
//! - `memory_pressure`: usage crossed the high-water mark or evictions burst
//! - `suspicious_access`: the access policy flagged a read pattern or an integrity failure
//!
//! Listeners for one event run in registration order on the task that triggered the
//! event, after the cache lock has been released. A panicking listener is logged and
//! skipped; remaining listeners still run and the cache operation still succeeds.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::policy::SuspicionReason;

// == Event Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MemoryPressure,
    SuspiciousAccess,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MemoryPressure => "memory_pressure",
            EventKind::SuspiciousAccess => "suspicious_access",
        }
    }

    /// Parses an event name as used by external subscribers.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "memory_pressure" => Some(EventKind::MemoryPressure),
            "suspicious_access" => Some(EventKind::SuspiciousAccess),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What pushed the cache into memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureTrigger {
    /// Usage crossed the configured high-water percentage
    HighWaterMark,
    /// Too many evictions inside the burst window
    EvictionBurst,
}

// == Cache Event ==
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    MemoryPressure {
        trigger: PressureTrigger,
        percentage: f64,
        used: usize,
        limit: usize,
        recent_evictions: u64,
    },
    SuspiciousAccess {
        key: String,
        reason: SuspicionReason,
    },
}

impl CacheEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::MemoryPressure { .. } => EventKind::MemoryPressure,
            CacheEvent::SuspiciousAccess { .. } => EventKind::SuspiciousAccess,
        }
    }
}

/// Callback invoked for each emitted event of the kind it subscribed to.
pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

// == Event Bus ==
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    // == Emit ==
    /// Delivers `event` to every listener of its kind.
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn emit(&self, event: &CacheEvent) -> usize {
        let kind = event.kind();
        // Snapshot so listeners may subscribe further without deadlocking
        let listeners: Vec<Listener> = match self.listeners.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| (listener.as_ref())(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("Listener #{} for {} panicked; continuing", index, kind),
            }
        }
        delivered
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Drops every registered listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("EventBus")
            .field(
                "memory_pressure",
                &listeners.get(&EventKind::MemoryPressure).map_or(0, Vec::len),
            )
            .field(
                "suspicious_access",
                &listeners.get(&EventKind::SuspiciousAccess).map_or(0, Vec::len),
            )
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn pressure_event() -> CacheEvent {
        CacheEvent::MemoryPressure {
            trigger: PressureTrigger::HighWaterMark,
            percentage: 95.0,
            used: 95,
            limit: 100,
            recent_evictions: 0,
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::MemoryPressure.as_str(), "memory_pressure");
        assert_eq!(EventKind::SuspiciousAccess.as_str(), "suspicious_access");
        assert_eq!(
            EventKind::from_name("suspicious_access"),
            Some(EventKind::SuspiciousAccess)
        );
        assert_eq!(EventKind::from_name("eviction"), None);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let calls = calls.clone();
            bus.on(EventKind::MemoryPressure, move |_| calls.lock().push(id));
        }

        assert_eq!(bus.emit(&pressure_event()), 3);
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_emit_only_reaches_matching_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        bus.on(EventKind::SuspiciousAccess, move |_| *counter.lock() += 1);

        assert_eq!(bus.emit(&pressure_event()), 0);
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = calls.clone();
        bus.on(EventKind::MemoryPressure, move |_| first.lock().push("first"));
        bus.on(EventKind::MemoryPressure, |_| panic!("listener failure"));
        let last = calls.clone();
        bus.on(EventKind::MemoryPressure, move |_| last.lock().push("last"));

        assert_eq!(bus.emit(&pressure_event()), 2);
        assert_eq!(*calls.lock(), vec!["first", "last"]);
    }

    #[test]
    fn test_clear_and_count() {
        let bus = EventBus::new();
        bus.on(EventKind::MemoryPressure, |_| {});
        bus.on(EventKind::MemoryPressure, |_| {});
        assert_eq!(bus.listener_count(EventKind::MemoryPressure), 2);
        assert_eq!(bus.listener_count(EventKind::SuspiciousAccess), 0);

        bus.clear();
        assert_eq!(bus.listener_count(EventKind::MemoryPressure), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = CacheEvent::SuspiciousAccess {
            key: "session:1".to_string(),
            reason: SuspicionReason::HighRequestRate {
                count: 1001,
                window_ms: 1000,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "suspicious_access");
        assert_eq!(json["key"], "session:1");
        assert_eq!(json["reason"]["kind"], "high_request_rate");
    }
}
