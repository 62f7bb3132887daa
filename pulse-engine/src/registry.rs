//! Subscription bookkeeping.
//!
//! Tracks which views are interested in which keys and whether each view is
//! interacting (paused). The scheduler reads pause state per tick and the
//! engine uses subscriber counts to time evictions.

use chrono::Utc;
use pulse_core::{new_entity_id, CacheKey, EntityId, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handle identifying one subscription (one key in one view instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(EntityId);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(new_entity_id())
    }

    pub fn as_uuid(&self) -> EntityId {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One view's interest in one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Name of the consuming view, for logs.
    pub view: String,
    pub key: CacheKey,
    /// Background refresh cadence; `None` means fetch once.
    pub interval: Option<Duration>,
    /// Set while the user is inspecting the view.
    pub paused: bool,
    pub created_at: Timestamp,
}

/// Outcome of removing the last subscription for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub key: CacheKey,
    /// Changes every time the key's count drops to zero.
    pub generation: u64,
}

#[derive(Debug, Default)]
struct KeyUsage {
    count: u32,
    generation: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    usage: HashMap<CacheKey, KeyUsage>,
}

/// Registry of live subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(
        &self,
        view: impl Into<String>,
        key: CacheKey,
        interval: Option<Duration>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let mut inner = self.lock();
        inner.usage.entry(key.clone()).or_default().count += 1;
        inner.subscriptions.insert(
            id,
            Subscription {
                id,
                view: view.into(),
                key,
                interval,
                paused: false,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Remove a subscription.
    ///
    /// Returns `Some` when this was the key's last subscriber, carrying the
    /// release generation the caller must present to [`is_idle_since`].
    ///
    /// [`is_idle_since`]: Self::is_idle_since
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<Released> {
        let mut inner = self.lock();
        let subscription = inner.subscriptions.remove(&id)?;
        let usage = inner.usage.get_mut(&subscription.key)?;
        usage.count = usage.count.saturating_sub(1);
        if usage.count > 0 {
            return None;
        }
        usage.generation += 1;
        Some(Released {
            key: subscription.key,
            generation: usage.generation,
        })
    }

    /// Toggle pause state. Returns false if the subscription does not exist.
    pub fn set_paused(&self, id: SubscriptionId, paused: bool) -> bool {
        match self.lock().subscriptions.get_mut(&id) {
            Some(subscription) => {
                subscription.paused = paused;
                true
            }
            None => false,
        }
    }

    /// Pause state, or `None` once the subscription is destroyed.
    pub fn is_paused(&self, id: SubscriptionId) -> Option<bool> {
        self.lock().subscriptions.get(&id).map(|s| s.paused)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        self.lock().subscriptions.get(&id).cloned()
    }

    pub fn count_subscribers(&self, key: &CacheKey) -> u32 {
        self.lock().usage.get(key).map(|u| u.count).unwrap_or(0)
    }

    /// True if the key has had no subscribers since the given release.
    pub fn is_idle_since(&self, key: &CacheKey, generation: u64) -> bool {
        match self.lock().usage.get(key) {
            Some(usage) => usage.count == 0 && usage.generation == generation,
            None => true,
        }
    }

    /// Forget the usage record of an evicted key.
    pub fn forget(&self, key: &CacheKey) {
        let mut inner = self.lock();
        if inner.usage.get(key).is_some_and(|u| u.count == 0) {
            inner.usage.remove(key);
        }
    }

    /// All subscriptions on a key.
    pub fn subscriptions_for(&self, key: &CacheKey) -> Vec<Subscription> {
        self.lock()
            .subscriptions
            .values()
            .filter(|s| &s.key == key)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
