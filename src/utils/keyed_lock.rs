use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

use super::lock_mutex;

/// One async mutex per key. Holders of the same key are serialized, different keys never
/// contend. Entries are dropped once nobody holds or waits on them.
pub struct KeyedLock<K> {
    slots: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}
impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}
impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
        }
    }
}

pub struct KeyedGuard<K: Hash + Eq + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}
impl<K: Hash + Eq + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = lock_mutex(&self.slots);
        // Only the map itself still references the slot: nobody is waiting.
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

impl<K: Hash + Eq + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let slot = lock_mutex(&self.slots)
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = slot.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            slots: self.slots.clone(),
        }
    }

    /// Like [`Self::lock`], but returns `None` instead of waiting if the key is held.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<K>> {
        let slot = lock_mutex(&self.slots)
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = slot.try_lock_owned().ok()?;
        Some(KeyedGuard {
            key,
            guard: Some(guard),
            slots: self.slots.clone(),
        })
    }

    pub fn is_locked(&self, key: &K) -> bool {
        lock_mutex(&self.slots)
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }
}
