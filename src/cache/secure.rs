//! Secure Cache Facade
//!
//! Composes the codec, crypto box, key manager, entry store, eviction controller,
//! stats and event bus behind `get`/`set`/`delete`/`clear`/`stats`/`shutdown`.
//!
//! # Concurrency
//! One async mutex guards all mutable state of an instance. A `get` performs its
//! lookup, decryption, LRU touch and any write-back re-encryption inside that single
//! critical section, so a racing `delete` can never resurrect an entry. Event
//! listeners run after the lock has been released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cache::eviction::{EvictionController, PressureMonitor};
use crate::cache::{
    current_timestamp_ms, CacheEntry, CacheStats, EntryStore, Footprint, MemoryUsage,
    StatsCollector, MAX_KEY_LENGTH,
};
use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::crypto::{entry_aad, CryptoBox, CryptoError, KeyManager, RotationPolicy};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventBus, EventKind};
use crate::policy::{AccessPolicy, RateLimitPolicy, SuspicionReason};
use crate::tasks::{spawn_reaper_task, ReaperHandle};

// == Set Options ==
/// Per-call options for [`SecureCache::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Entry lifetime; the configured default TTL when None. Clamped to the TTL ceiling.
    pub ttl: Option<Duration>,
    /// Force compression on or off regardless of the size threshold
    pub compress: Option<bool>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            compress: None,
        }
    }

    pub fn force_compression(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }
}

// == Reap Report ==
/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Expired entries removed
    pub expired: usize,
    /// Lock acquisitions that removed at least one entry
    pub batches: usize,
    /// New key version when the pass performed a scheduled rotation
    pub rotated_to: Option<u32>,
    pub purged_key_versions: Vec<u32>,
    pub deferred_key_versions: Vec<u32>,
}

struct CacheState {
    store: EntryStore,
    keys: KeyManager,
    stats: StatsCollector,
    pressure: PressureMonitor,
    policy: Box<dyn AccessPolicy>,
    closed: bool,
}

struct Shared {
    state: Mutex<CacheState>,
    /// Fast-path flag; `CacheState::closed` is authoritative
    closed: AtomicBool,
    events: EventBus,
    codec: Codec,
    crypto: CryptoBox,
    eviction: EvictionController,
    config: CacheConfig,
    reaper: parking_lot::Mutex<Option<ReaperHandle>>,
    shutdown: OnceCell<()>,
}

// == Secure Cache ==
/// Handle to an encrypted in-memory cache instance.
///
/// Cloning is cheap; every clone refers to the same instance.
#[derive(Clone)]
pub struct SecureCache {
    shared: Arc<Shared>,
}

/// Non-owning handle held by the background reaper.
#[derive(Clone, Debug)]
pub struct WeakSecureCache {
    shared: Weak<Shared>,
}

impl WeakSecureCache {
    /// Returns a strong handle while the cache is still alive.
    pub fn upgrade(&self) -> Option<SecureCache> {
        self.shared.upgrade().map(|shared| SecureCache { shared })
    }
}

impl SecureCache {
    // == Constructor ==
    /// Creates a cache with the default [`RateLimitPolicy`].
    ///
    /// When called inside a tokio runtime the background reaper is started;
    /// otherwise expired entries are removed lazily on read and by
    /// [`reap_expired`](Self::reap_expired).
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_access_policy(config, RateLimitPolicy::default())
    }

    /// Creates a cache that reports suspicious access through `policy`.
    pub fn with_access_policy<P: AccessPolicy>(config: CacheConfig, policy: P) -> Result<Self> {
        config.validate()?;

        let keys = KeyManager::new(
            config.secret.as_deref().map(str::as_bytes),
            config.kdf_iterations,
            RotationPolicy {
                max_age: config.key_rotation_interval,
                max_encryptions: config.max_encryptions_per_key,
            },
        )?;

        let state = CacheState {
            store: EntryStore::new(),
            keys,
            stats: StatsCollector::new(),
            pressure: PressureMonitor::new(
                config.memory_pressure_threshold,
                PressureMonitor::DEFAULT_BURST_WINDOW,
                PressureMonitor::DEFAULT_BURST_THRESHOLD,
            ),
            policy: Box::new(policy),
            closed: false,
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
            events: EventBus::new(),
            codec: Codec::new(config.compression_threshold),
            crypto: CryptoBox::new(),
            eviction: EvictionController::new(config.max_memory_bytes, config.max_entries),
            config,
            reaper: parking_lot::Mutex::new(None),
            shutdown: OnceCell::new(),
        });

        let cache = Self { shared };
        cache.start_reaper();

        info!(
            "Secure cache initialized: budget={} bytes, max_entries={}, default_ttl={:?}",
            cache.shared.config.max_memory_bytes,
            cache.shared.config.max_entries,
            cache.shared.config.default_ttl
        );
        Ok(cache)
    }

    fn start_reaper(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime available; expired entries are only removed on access");
            return;
        }
        let handle = spawn_reaper_task(self.downgrade(), self.shared.config.reaper_interval);
        *self.shared.reaper.lock() = Some(handle);
    }

    pub fn downgrade(&self) -> WeakSecureCache {
        WeakSecureCache {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        Ok(())
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, CacheState>> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(CacheError::CacheClosed);
        }
        Ok(state)
    }

    fn dispatch(&self, events: Vec<CacheEvent>) {
        for event in &events {
            self.shared.events.emit(event);
        }
    }

    // == Get ==
    /// Retrieves and decrypts a value.
    ///
    /// Returns `Ok(None)` for absent or expired keys, which is distinct from a stored
    /// JSON `null`. An entry that fails authentication or decoding is reported,
    /// removed and returned as an error.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        self.ensure_open()?;

        let mut events = Vec::new();
        let result = {
            let mut state = self.lock_open().await?;
            self.read_locked(&mut state, key, &mut events)
        };
        self.dispatch(events);
        result
    }

    fn read_locked(
        &self,
        state: &mut CacheState,
        key: &str,
        events: &mut Vec<CacheEvent>,
    ) -> Result<Option<Value>> {
        let now_ms = current_timestamp_ms();

        let Some(entry) = state.store.get(key) else {
            state.stats.record_miss();
            Self::observe_read(state, key, events);
            return Ok(None);
        };

        if entry.is_expired_at(now_ms) {
            state.store.remove(key);
            state.policy.on_removed(key);
            state.stats.record_miss();
            state.stats.record_expirations(1);
            debug!("Removed expired entry on read: {}", key);
            Self::observe_read(state, key, events);
            return Ok(None);
        }

        let version = entry.key_version;
        let compressed = entry.compressed;
        let decoded = self.open_entry(&state.keys, entry).and_then(|plaintext| {
            let value = self.shared.codec.decode(&plaintext, compressed)?;
            Ok((plaintext, value))
        });
        let (plaintext, value) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => return Err(self.reject_entry(state, key, err, events)),
        };

        if state.keys.active_version() != Some(version) {
            self.write_back(state, key, &plaintext);
        }

        state.store.record_access(key, now_ms);
        state.stats.record_hit();
        Self::observe_read(state, key, events);
        Ok(Some(value))
    }

    /// Feeds a read to the access policy. Misses count the same as hits.
    fn observe_read(state: &mut CacheState, key: &str, events: &mut Vec<CacheEvent>) {
        if let Some(reason) = state.policy.on_read(key) {
            events.push(CacheEvent::SuspiciousAccess {
                key: key.to_string(),
                reason,
            });
        }
    }

    fn open_entry(&self, keys: &KeyManager, entry: &CacheEntry) -> Result<Zeroizing<Vec<u8>>> {
        let key = keys.decryptable_key(entry.key_version)?;
        let aad = entry_aad(&entry.key, entry.key_version);

        self.shared
            .crypto
            .open(&entry.ciphertext, &entry.nonce, &entry.auth_tag, key, &aad)
            .map(Zeroizing::new)
            .map_err(|err| match err {
                CryptoError::AuthenticationFailed => {
                    CacheError::AuthenticationFailed(entry.key.clone())
                }
                other => other.into(),
            })
    }

    /// Records a failed read and discards the entry when it can never be opened again.
    fn reject_entry(
        &self,
        state: &mut CacheState,
        key: &str,
        err: CacheError,
        events: &mut Vec<CacheEvent>,
    ) -> CacheError {
        if err.is_integrity_failure() {
            state.stats.record_auth_failure();
            warn!("Integrity check failed; discarding entry ({})", err);
            events.push(CacheEvent::SuspiciousAccess {
                key: key.to_string(),
                reason: SuspicionReason::IntegrityFailure {
                    detail: err.to_string(),
                },
            });
            if let Some(reason) = state.policy.on_integrity_failure(key) {
                events.push(CacheEvent::SuspiciousAccess {
                    key: key.to_string(),
                    reason,
                });
            }
        }

        if err.is_integrity_failure() || matches!(err, CacheError::KeyUnavailable(_)) {
            state.store.remove(key);
            state.policy.on_removed(key);
        }
        err
    }

    /// Re-encrypts an entry sealed under a retired key with the current key.
    ///
    /// Rotates first when the current key has reached its age or encryption cap.
    /// A failure leaves the old ciphertext in place.
    fn write_back(&self, state: &mut CacheState, key: &str, plaintext: &[u8]) {
        if state.keys.needs_rotation() {
            if let Err(err) = state.keys.rotate() {
                warn!("Key rotation before write-back failed: {}", err);
                return;
            }
        }

        let sealed = state.keys.current_key().and_then(|current| {
            let version = current.version();
            self.shared
                .crypto
                .seal(plaintext, current, &entry_aad(key, version))
                .map(|sealed| (sealed, version))
        });

        match sealed {
            Ok((sealed, version)) => {
                state.keys.record_encryption();
                state.store.reseal(key, sealed, version);
                state.stats.record_reencryption();
                debug!("Re-encrypted {} under key version {}", key, version);
            }
            Err(err) => warn!("Write-back re-encryption failed: {}", err),
        }
    }

    // == Set ==
    /// Encrypts and stores a value, replacing any existing entry under `key`.
    ///
    /// Fails with `ValueTooLarge` when the encoded value exceeds the whole memory
    /// budget; nothing is evicted in that case.
    pub async fn set(&self, key: impl Into<String>, value: Value, options: SetOptions) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        self.ensure_open()?;

        let encoded = self.shared.codec.encode(&value, options.compress)?;
        self.shared.eviction.admit(encoded.len())?;

        let config = &self.shared.config;
        let ttl = options.ttl.unwrap_or(config.default_ttl).min(config.max_ttl);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let event = {
            let mut guard = self.lock_open().await?;
            let state = &mut *guard;

            if state.keys.needs_rotation() {
                state.keys.rotate()?;
            }
            let current = state.keys.current_key()?;
            let version = current.version();
            let sealed = self
                .shared
                .crypto
                .seal(&encoded.bytes, current, &entry_aad(&key, version))?;
            state.keys.record_encryption();

            state.store.put(CacheEntry::new(
                key,
                sealed,
                version,
                encoded.compressed,
                encoded.len(),
                Some(ttl_ms),
            ));
            state.stats.record_set();

            let evicted = self.shared.eviction.enforce(&mut state.store);
            for evicted_key in &evicted {
                state.policy.on_removed(evicted_key);
            }
            if !evicted.is_empty() {
                debug!("Evicted {} entries to stay within budget", evicted.len());
                state.stats.record_evictions(evicted.len() as u64);
            }

            let usage = MemoryUsage::new(state.store.total_size(), self.shared.eviction.budget());
            state
                .pressure
                .observe(usage, evicted.len() as u64)
        };

        if let Some(event) = event {
            warn!("Memory pressure: {:?}", event);
            self.shared.events.emit(&event);
        }
        Ok(())
    }

    // == Delete ==
    /// Removes an entry. Returns false if the key was absent.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.ensure_open()?;

        let mut guard = self.lock_open().await?;
        let state = &mut *guard;
        let removed = state.store.remove(key).is_some();
        if removed {
            state.policy.on_removed(key);
            state.stats.record_delete();
        }
        Ok(removed)
    }

    // == Clear ==
    /// Removes every entry. Counters are kept; size accounting starts from zero.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_open()?;

        let mut guard = self.lock_open().await?;
        let state = &mut *guard;
        let dropped = state.store.clear();
        state.pressure.reset();
        state.policy.prune();

        let store = &state.store;
        state
            .keys
            .purge_retired(|version| store.version_refs(version), self.shared.config.max_ttl);

        info!("Cache cleared: {} entries removed", dropped);
        Ok(())
    }

    // == Stats ==
    /// Returns a snapshot of cache health. Still readable after shutdown.
    pub async fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock().await;
        state.stats.snapshot(Footprint {
            entry_count: state.store.len(),
            total_size: state.store.total_size(),
            budget: self.shared.eviction.budget(),
            key_rotations: state.keys.rotations(),
            active_key_version: state.keys.active_version(),
            retained_key_versions: state.keys.retained_versions(),
        })
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.state.lock().await.store.is_empty()
    }

    // == Events ==
    /// Subscribes `listener` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Result<()>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.shared.events.on(kind, listener);
        Ok(())
    }

    // == Key Rotation ==
    /// Rotates to a new key version immediately and purges unreferenced retired keys.
    ///
    /// Existing entries are re-encrypted lazily when next read.
    pub async fn rotate_key(&self) -> Result<u32> {
        self.ensure_open()?;

        let mut guard = self.lock_open().await?;
        let state = &mut *guard;
        let version = state.keys.rotate()?;

        let store = &state.store;
        state
            .keys
            .purge_retired(|v| store.version_refs(v), self.shared.config.max_ttl);
        Ok(version)
    }

    // == Reap Expired ==
    /// Removes expired entries in batches, releasing the lock between batches, then
    /// performs key maintenance and prunes access-policy state.
    pub async fn reap_expired(&self) -> Result<ReapReport> {
        let batch_size = self.shared.config.reaper_batch_size;
        let mut report = ReapReport::default();

        loop {
            self.ensure_open()?;
            let removed = {
                let mut guard = self.lock_open().await?;
                let state = &mut *guard;
                let batch: Vec<String> = state
                    .store
                    .iter_expired(current_timestamp_ms())
                    .take(batch_size)
                    .map(str::to_owned)
                    .collect();
                for key in &batch {
                    state.store.remove(key);
                    state.policy.on_removed(key);
                }
                state.stats.record_expirations(batch.len() as u64);
                batch.len()
            };

            if removed == 0 {
                break;
            }
            report.expired += removed;
            report.batches += 1;
            if removed < batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        let mut guard = self.lock_open().await?;
        let state = &mut *guard;
        if state.keys.needs_rotation() {
            match state.keys.rotate() {
                Ok(version) => report.rotated_to = Some(version),
                Err(err) => warn!("Scheduled key rotation failed: {}", err),
            }
        }

        let store = &state.store;
        let purge = state
            .keys
            .purge_retired(|v| store.version_refs(v), self.shared.config.max_ttl);
        report.purged_key_versions = purge.purged;
        report.deferred_key_versions = purge.deferred;

        state.policy.prune();
        Ok(report)
    }

    // == Shutdown ==
    /// Stops the reaper, waits for an in-flight pass, wipes all entries and destroys
    /// key material. Later operations fail with `CacheClosed`. Idempotent.
    pub async fn shutdown(&self) {
        self.shared
            .shutdown
            .get_or_init(|| async {
                self.shared.closed.store(true, Ordering::SeqCst);

                let reaper = self.shared.reaper.lock().take();
                if let Some(reaper) = reaper {
                    reaper.stop().await;
                }

                let dropped = {
                    let mut state = self.shared.state.lock().await;
                    state.closed = true;
                    let dropped = state.store.clear();
                    state.keys.release();
                    dropped
                };
                self.shared.events.clear();

                info!("Secure cache shut down: {} entries wiped", dropped);
            })
            .await;
    }

    // == Typed Helpers ==
    /// Like [`get`](Self::get), deserializing the stored value into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Like [`set`](Self::set), serializing `value` first.
    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
        options: SetOptions,
    ) -> Result<()> {
        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, value, options).await
    }

    /// Seals `plaintext` for `key` under the current key, as `set` would.
    #[cfg(test)]
    pub(crate) async fn seal_with_current_key(
        &self,
        key: &str,
        plaintext: &[u8],
    ) -> (crate::crypto::Sealed, u32) {
        let state = self.shared.state.lock().await;
        let current = state.keys.current_key().unwrap();
        let version = current.version();
        let sealed = self
            .shared
            .crypto
            .seal(plaintext, current, &entry_aad(key, version))
            .unwrap();
        (sealed, version)
    }

    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, key: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut CacheEntry),
    {
        let mut state = self.shared.state.lock().await;
        match state.store.entry_mut(key) {
            Some(entry) => {
                mutate(entry);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SecureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCache")
            .field("closed", &self.is_closed())
            .field("config", &self.shared.config)
            .field("events", &self.shared.events)
            .finish_non_exhaustive()
    }
}

// == Key Validation ==
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidKey(format!(
            "key length {} exceeds maximum of {} bytes",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn test_config() -> CacheConfig {
        CacheConfig {
            kdf_iterations: 1,
            ..CacheConfig::default()
        }
    }

    fn recorder(cache: &SecureCache, kind: EventKind) -> Arc<SyncMutex<Vec<CacheEvent>>> {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        cache
            .on(kind, move |event| sink.lock().push(event.clone()))
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn test_flipped_ciphertext_is_rejected_and_removed() {
        let cache = SecureCache::new(test_config()).unwrap();
        let seen = recorder(&cache, EventKind::SuspiciousAccess);
        cache
            .set("secret", json!({"token": "abc"}), SetOptions::default())
            .await
            .unwrap();

        assert!(cache.tamper("secret", |entry| entry.ciphertext[0] ^= 0x01).await);

        let err = cache.get("secret").await.unwrap_err();
        assert!(matches!(err, CacheError::AuthenticationFailed(ref k) if k == "secret"));
        assert_eq!(cache.get("secret").await.unwrap(), None);

        let stats = cache.stats().await;
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.entry_count, 0);

        let events = seen.lock();
        assert!(matches!(
            &events[0],
            CacheEvent::SuspiciousAccess {
                reason: SuspicionReason::IntegrityFailure { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_modified_tag_is_rejected() {
        let cache = SecureCache::new(test_config()).unwrap();
        cache.set("k", json!(1), SetOptions::default()).await.unwrap();
        cache.tamper("k", |entry| entry.auth_tag[15] ^= 0x80).await;

        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_ciphertext_bound_to_its_key() {
        let cache = SecureCache::new(test_config()).unwrap();
        cache.set("a", json!("alpha"), SetOptions::default()).await.unwrap();
        cache.set("b", json!("bravo"), SetOptions::default()).await.unwrap();

        // Transplant a's ciphertext under b
        let mut stolen = None;
        cache
            .tamper("a", |entry| {
                stolen = Some((entry.ciphertext.clone(), entry.nonce, entry.auth_tag))
            })
            .await;
        let (ciphertext, nonce, tag) = stolen.unwrap();
        cache
            .tamper("b", move |entry| {
                entry.ciphertext = ciphertext;
                entry.nonce = nonce;
                entry.auth_tag = tag;
            })
            .await;

        assert!(matches!(
            cache.get("b").await,
            Err(CacheError::AuthenticationFailed(_))
        ));
        assert_eq!(cache.get("a").await.unwrap(), Some(json!("alpha")));
    }

    #[tokio::test]
    async fn test_repeated_integrity_failures_escalate() {
        let cache = SecureCache::new(test_config()).unwrap();
        let seen = recorder(&cache, EventKind::SuspiciousAccess);

        for key in ["a", "b", "c"] {
            cache.set(key, json!(key), SetOptions::default()).await.unwrap();
            cache.tamper(key, |entry| entry.ciphertext[0] ^= 0xff).await;
            let _ = cache.get(key).await;
        }

        let events = seen.lock();
        assert!(events.iter().any(|event| matches!(
            event,
            CacheEvent::SuspiciousAccess {
                reason: SuspicionReason::RepeatedIntegrityFailures { count: 3, .. },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_undecodable_plaintext_is_corrupt_payload() {
        let cache = SecureCache::new(test_config()).unwrap();
        let seen = recorder(&cache, EventKind::SuspiciousAccess);
        cache.set("doc", json!({"a": 1}), SetOptions::default()).await.unwrap();

        // Authenticates under the current key but is not JSON
        let (sealed, version) = cache.seal_with_current_key("doc", b"{not json").await;
        assert!(
            cache
                .tamper("doc", move |entry| {
                    entry.ciphertext = sealed.ciphertext;
                    entry.nonce = sealed.nonce;
                    entry.auth_tag = sealed.tag;
                    entry.key_version = version;
                    entry.compressed = false;
                })
                .await
        );

        assert!(matches!(
            cache.get("doc").await,
            Err(CacheError::CorruptPayload(_))
        ));

        let stats = cache.stats().await;
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(cache.get("doc").await.unwrap(), None);

        let events = seen.lock();
        assert!(matches!(
            &events[0],
            CacheEvent::SuspiciousAccess {
                key,
                reason: SuspicionReason::IntegrityFailure { .. },
            } if key == "doc"
        ));
    }

    #[tokio::test]
    async fn test_rotation_write_back_on_read() {
        let cache = SecureCache::new(test_config()).unwrap();
        cache.set("k", json!([1, 2, 3]), SetOptions::default()).await.unwrap();

        let v2 = cache.rotate_key().await.unwrap();
        assert_eq!(v2, 2);
        assert_eq!(cache.stats().await.retained_key_versions, 1);

        assert_eq!(cache.get("k").await.unwrap(), Some(json!([1, 2, 3])));

        let mut version = 0;
        cache.tamper("k", |entry| version = entry.key_version).await;
        assert_eq!(version, 2);

        let stats = cache.stats().await;
        assert_eq!(stats.reencryptions, 1);

        // Version 1 is now unreferenced and purged on the next pass
        let report = cache.reap_expired().await.unwrap();
        assert_eq!(report.purged_key_versions, vec![1]);
        assert_eq!(cache.stats().await.retained_key_versions, 0);
    }

    #[tokio::test]
    async fn test_encryption_budget_triggers_rotation_on_write() {
        let config = CacheConfig {
            max_encryptions_per_key: 2,
            ..test_config()
        };
        let cache = SecureCache::new(config).unwrap();
        cache.set("a", json!(1), SetOptions::default()).await.unwrap();
        cache.set("b", json!(2), SetOptions::default()).await.unwrap();
        assert_eq!(cache.stats().await.active_key_version, Some(1));

        cache.set("c", json!(3), SetOptions::default()).await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.active_key_version, Some(2));
        assert_eq!(stats.key_rotations, 1);
        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_write_back_respects_encryption_budget() {
        let config = CacheConfig {
            max_encryptions_per_key: 2,
            ..test_config()
        };
        let cache = SecureCache::new(config).unwrap();
        cache.set("a", json!("a"), SetOptions::default()).await.unwrap();
        cache.set("b", json!("b"), SetOptions::default()).await.unwrap();
        assert_eq!(cache.rotate_key().await.unwrap(), 2);
        cache.set("x", json!("x"), SetOptions::default()).await.unwrap();

        // Version 2 takes one more encryption, then reaches its cap
        assert_eq!(cache.get("a").await.unwrap(), Some(json!("a")));
        assert_eq!(cache.stats().await.active_key_version, Some(2));

        assert_eq!(cache.get("b").await.unwrap(), Some(json!("b")));
        assert_eq!(cache.stats().await.active_key_version, Some(3));

        let mut version = 0;
        cache.tamper("b", |entry| version = entry.key_version).await;
        assert_eq!(version, 3);
        assert_eq!(cache.get("x").await.unwrap(), Some(json!("x")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_reaper_pass() {
        let config = CacheConfig {
            reaper_interval: Duration::from_millis(5),
            reaper_batch_size: 1,
            ..test_config()
        };
        let cache = SecureCache::new(config).unwrap();
        for i in 0..2_000 {
            cache
                .set(
                    format!("k{}", i),
                    json!(i),
                    SetOptions::with_ttl(Duration::from_millis(1)),
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache
            .shared
            .reaper
            .lock()
            .as_ref()
            .is_some_and(|reaper| !reaper.is_finished()));

        cache.shutdown().await;

        // The reaper task owns the only weak handle and any strong one taken for a pass
        assert!(cache.shared.reaper.lock().is_none());
        assert_eq!(Arc::weak_count(&cache.shared), 0);
        assert_eq!(Arc::strong_count(&cache.shared), 1);
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_key_validation() {
        let cache = SecureCache::new(test_config()).unwrap();
        assert!(matches!(
            cache.set("", json!(1), SetOptions::default()).await,
            Err(CacheError::InvalidKey(_))
        ));
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(
            cache.get(&long_key).await,
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_construction_without_runtime() {
        let cache = SecureCache::new(test_config()).unwrap();
        assert!(cache.shared.reaper.lock().is_none());
        assert!(!cache.is_closed());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CacheConfig {
            max_memory_bytes: 0,
            ..test_config()
        };
        assert!(matches!(
            SecureCache::new(config),
            Err(CacheError::InvalidConfig(_))
        ));
    }
}
