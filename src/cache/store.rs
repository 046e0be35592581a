//! Entry Store Module
//!
//! Primary map from cache key to encrypted entry, combined with an O(1) LRU list,
//! an expiry index and per-key-version reference counts.

use std::collections::{BTreeSet, HashMap};

use crate::cache::lru::{LruList, NodeId};
use crate::cache::CacheEntry;
use crate::crypto::Sealed;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    node: NodeId,
}

// == Entry Store ==
/// Owns every live entry of one cache instance.
///
/// All methods take `&self`/`&mut self`; callers serialize mutations behind the
/// cache's single critical section.
#[derive(Debug, Default)]
pub struct EntryStore {
    /// Key -> entry + LRU handle
    entries: HashMap<String, Slot>,
    /// Recency order
    lru: LruList,
    /// (expires_at, key) for every entry with a TTL
    expiry: BTreeSet<(u64, String)>,
    /// Live entry count per key version
    version_refs: HashMap<u32, usize>,
    /// Sum of `plaintext_size` over live entries
    total_size: usize,
}

impl EntryStore {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Get ==
    /// Looks up an entry without changing its recency.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key).map(|slot| &slot.entry)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    // == Put ==
    /// Inserts an entry as most recently used.
    ///
    /// An existing entry under the same key is replaced and returned.
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let replaced = self.remove(&entry.key);

        let node = self.lru.push_front(entry.key.clone());
        if let Some(expires_at) = entry.expires_at {
            self.expiry.insert((expires_at, entry.key.clone()));
        }
        *self.version_refs.entry(entry.key_version).or_insert(0) += 1;
        self.total_size += entry.plaintext_size;

        self.entries
            .insert(entry.key.clone(), Slot { entry, node });
        replaced
    }

    // == Remove ==
    /// Removes an entry; its `plaintext_size` is the size released.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.lru.remove(slot.node);
        self.forget(&slot.entry);
        Some(slot.entry)
    }

    fn forget(&mut self, entry: &CacheEntry) {
        if let Some(expires_at) = entry.expires_at {
            self.expiry.remove(&(expires_at, entry.key.clone()));
        }
        if let Some(refs) = self.version_refs.get_mut(&entry.key_version) {
            *refs -= 1;
            if *refs == 0 {
                self.version_refs.remove(&entry.key_version);
            }
        }
        self.total_size -= entry.plaintext_size;
    }

    // == Touch ==
    /// Moves an entry to the most recently used position.
    ///
    /// Returns false if the key is absent.
    pub fn touch(&mut self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(slot) => {
                self.lru.touch(slot.node);
                true
            }
            None => false,
        }
    }

    // == Record Access ==
    /// Touches an entry and updates its access metadata.
    pub fn record_access(&mut self, key: &str, now: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.entry.record_access(now);
                self.lru.touch(slot.node);
                true
            }
            None => false,
        }
    }

    // == Reseal ==
    /// Swaps in a ciphertext produced under `key_version`, keeping reference counts
    /// consistent. Returns false if the key is absent.
    pub fn reseal(&mut self, key: &str, sealed: Sealed, key_version: u32) -> bool {
        let Some(slot) = self.entries.get_mut(key) else {
            return false;
        };

        let old_version = slot.entry.key_version;
        slot.entry.reseal(sealed, key_version);

        if old_version != key_version {
            if let Some(refs) = self.version_refs.get_mut(&old_version) {
                *refs -= 1;
                if *refs == 0 {
                    self.version_refs.remove(&old_version);
                }
            }
            *self.version_refs.entry(key_version).or_insert(0) += 1;
        }
        true
    }

    // == Evict Oldest ==
    /// Removes and returns the least recently used entry.
    pub fn evict_oldest(&mut self) -> Option<CacheEntry> {
        let key = self.lru.pop_oldest()?;
        let slot = self.entries.remove(&key)?;
        self.forget(&slot.entry);
        Some(slot.entry)
    }

    /// Key of the least recently used entry
    pub fn peek_oldest(&self) -> Option<&str> {
        self.lru.peek_oldest()
    }

    // == Iterate Expired ==
    /// Lazily yields keys whose `expires_at <= now`, earliest expiry first.
    ///
    /// The sequence is finite and borrows the store; collect a batch before removing.
    pub fn iter_expired(&self, now: u64) -> impl Iterator<Item = &str> + '_ {
        self.expiry
            .iter()
            .take_while(move |(expires_at, _)| *expires_at <= now)
            .map(|(_, key)| key.as_str())
    }

    // == Clear ==
    /// Removes every entry and returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.lru.clear();
        self.expiry.clear();
        self.version_refs.clear();
        self.total_size = 0;
        count
    }

    /// Number of live entries sealed under `version`
    pub fn version_refs(&self, version: u32) -> usize {
        self.version_refs.get(&version).copied().unwrap_or(0)
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &str> + '_ {
        self.lru.iter()
    }

    /// Sum of encoded payload sizes across live entries
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    // == Length ==
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn entry_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key).map(|slot| &mut slot.entry)
    }
}
