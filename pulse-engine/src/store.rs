//! In-memory cache store.
//!
//! The store is the only mutable state the engine keeps about a key. Every
//! write goes through `put`, `update`, `upsert`, `invalidate` or `evict`,
//! all synchronous. Each write bumps a per-key version and then notifies,
//! after the internal lock is released, every watcher whose last notified
//! version is behind.

use crate::clock::Clock;
use crate::registry::SubscriptionId;
use pulse_core::{CacheKey, QueryEntry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Callback invoked with the key's new version after a write.
pub type Listener = Arc<dyn Fn(u64) + Send + Sync>;

struct Slot {
    entry: QueryEntry,
    version: u64,
}

struct Watcher {
    key: CacheKey,
    last_notified_version: u64,
    listener: Listener,
}

#[derive(Default)]
struct StoreInner {
    slots: HashMap<CacheKey, Slot>,
    watchers: HashMap<SubscriptionId, Watcher>,
}

impl StoreInner {
    /// Bump the version and collect the listeners that are behind it.
    fn bump(&mut self, key: &CacheKey) -> Vec<(Listener, u64)> {
        let version = match self.slots.get_mut(key) {
            Some(slot) => {
                slot.version += 1;
                slot.version
            }
            None => return Vec::new(),
        };
        self.collect_listeners(key, version)
    }

    fn collect_listeners(&mut self, key: &CacheKey, version: u64) -> Vec<(Listener, u64)> {
        self.watchers
            .values_mut()
            .filter(|w| &w.key == key && w.last_notified_version < version)
            .map(|w| {
                w.last_notified_version = version;
                (Arc::clone(&w.listener), version)
            })
            .collect()
    }
}

/// Map from cache key to [`QueryEntry`] with change notification.
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Store operations cannot fail; a panicking listener never holds the lock.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(pending: Vec<(Listener, u64)>) {
        for (listener, version) in pending {
            listener(version);
        }
    }

    /// Read an entry. Never blocks on I/O.
    pub fn get(&self, key: &CacheKey) -> Option<QueryEntry> {
        self.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Current version of a key, 0 if absent.
    pub fn version(&self, key: &CacheKey) -> u64 {
        self.lock().slots.get(key).map(|slot| slot.version).unwrap_or(0)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live key, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.lock().slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Every live entry, sorted by key.
    pub fn snapshot(&self) -> Vec<(CacheKey, QueryEntry)> {
        let mut entries: Vec<(CacheKey, QueryEntry)> = self
            .lock()
            .slots
            .iter()
            .map(|(key, slot)| (key.clone(), slot.entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Insert an idle entry if the key is absent and return the current entry.
    ///
    /// Creation is not a change of observable state, so nothing is notified.
    pub fn ensure(&self, key: &CacheKey, stale_after: Duration) -> QueryEntry {
        let mut inner = self.lock();
        inner
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot {
                entry: QueryEntry::new(stale_after),
                version: 0,
            })
            .entry
            .clone()
    }

    /// Replace an entry and notify watchers. Returns the new version.
    pub fn put(&self, key: &CacheKey, entry: QueryEntry) -> u64 {
        let (version, pending) = {
            let mut inner = self.lock();
            let version = match inner.slots.get_mut(key) {
                Some(slot) => {
                    slot.entry = entry;
                    slot.version += 1;
                    slot.version
                }
                None => {
                    inner.slots.insert(key.clone(), Slot { entry, version: 1 });
                    1
                }
            };
            (version, inner.collect_listeners(key, version))
        };
        Self::notify(pending);
        version
    }

    /// Re-read-then-write an existing entry.
    ///
    /// `f` returns its result and whether it changed the entry; only a change
    /// bumps the version and notifies. Returns `None` if the key is absent.
    pub fn update<R>(&self, key: &CacheKey, f: impl FnOnce(&mut QueryEntry) -> (R, bool)) -> Option<R> {
        let (result, pending) = {
            let mut inner = self.lock();
            let slot = inner.slots.get_mut(key)?;
            let (result, changed) = f(&mut slot.entry);
            let pending = if changed { inner.bump(key) } else { Vec::new() };
            (result, pending)
        };
        Self::notify(pending);
        Some(result)
    }

    /// Like [`update`](Self::update) but inserts an idle entry first if absent.
    pub fn upsert<R>(
        &self,
        key: &CacheKey,
        stale_after: Duration,
        f: impl FnOnce(&mut QueryEntry) -> (R, bool),
    ) -> R {
        let (result, pending) = {
            let mut inner = self.lock();
            let slot = inner.slots.entry(key.clone()).or_insert_with(|| Slot {
                entry: QueryEntry::new(stale_after),
                version: 0,
            });
            let (result, changed) = f(&mut slot.entry);
            let pending = if changed { inner.bump(key) } else { Vec::new() };
            (result, pending)
        };
        Self::notify(pending);
        result
    }

    /// Mark an entry stale without clearing its data.
    ///
    /// The outstanding fetch, if any, is detached so its response is
    /// discarded. Repeated calls before the next refresh are no-ops.
    /// Returns true if the entry changed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let changed = self
            .update(key, |entry| {
                let detached = entry.detach_in_flight();
                let changed = detached || !entry.invalidated;
                entry.invalidated = true;
                (changed, changed)
            })
            .unwrap_or(false);
        if changed {
            tracing::trace!(key = %key, "Entry invalidated");
        }
        changed
    }

    /// Invalidate every key of an entity. Returns the number of entries changed.
    pub fn invalidate_entity(&self, entity: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .lock()
            .slots
            .keys()
            .filter(|k| k.entity() == entity)
            .cloned()
            .collect();
        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    /// Remove an entry entirely. Watchers on the key are left registered.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let removed = self.lock().slots.remove(key).is_some();
        if removed {
            tracing::debug!(key = %key, "Entry evicted");
        }
        removed
    }

    /// Register a watcher for a key on behalf of a subscription.
    ///
    /// The watcher starts at the key's current version, so it is only told
    /// about later writes.
    pub fn watch(&self, subscription: SubscriptionId, key: &CacheKey, listener: Listener) {
        let mut inner = self.lock();
        let version = inner.slots.get(key).map(|slot| slot.version).unwrap_or(0);
        inner.watchers.insert(
            subscription,
            Watcher {
                key: key.clone(),
                last_notified_version: version,
                listener,
            },
        );
    }

    pub fn unwatch(&self, subscription: SubscriptionId) -> bool {
        self.lock().watchers.remove(&subscription).is_some()
    }
}
