//! Lock-striped store segments.
//!
//! A segment is one shard of the store map plus the [`KeyLock`] guarding
//! every key hashed to it. The segment exposes only primitive map
//! operations; callers acquire the appropriate lock mode first, and the
//! compound store layers the substitution protocol, pool accounting, and
//! notifications on top.
//!
//! The map itself sits behind a short-lived [`parking_lot::RwLock`] so
//! cross-segment reads that do not take key locks (size, key listing,
//! eviction sampling) stay safe. The key lock, not the map lock, is what
//! orders operations on a key.

use crate::disk::substitute::Entry;
use crate::sync::KeyLock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

pub(crate) struct Segment<K, V> {
    lock: KeyLock,
    map: RwLock<HashMap<K, Entry<K, V>, ahash::RandomState>>,
}

impl<K: Eq + Hash + Clone, V> Segment<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            lock: KeyLock::new(),
            map: RwLock::new(HashMap::default()),
        }
    }

    /// The key lock guarding this segment.
    pub(crate) fn lock(&self) -> &KeyLock {
        &self.lock
    }

    /// Current entry for `key`, if any.
    pub(crate) fn entry(&self, key: &K) -> Option<Entry<K, V>> {
        self.map.read().get(key).cloned()
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    /// Install `entry`, returning the displaced entry. The caller frees the
    /// displaced entry while still holding the write lock.
    pub(crate) fn insert(&self, key: K, entry: Entry<K, V>) -> Option<Entry<K, V>> {
        self.map.write().insert(key, entry)
    }

    /// Install `entry` only if `key` is unmapped. Returns the existing
    /// entry otherwise, leaving the map unchanged.
    pub(crate) fn try_insert(&self, key: &K, entry: &Entry<K, V>) -> Option<Entry<K, V>> {
        let mut map = self.map.write();
        match map.get(key) {
            Some(existing) => Some(existing.clone()),
            None => {
                map.insert(key.clone(), entry.clone());
                None
            }
        }
    }

    /// Remove the mapping for `key`, returning the displaced entry.
    pub(crate) fn remove(&self, key: &K) -> Option<Entry<K, V>> {
        self.map.write().remove(key)
    }

    /// Swap the entry for `key` from `expect` to `new`, comparing by entry
    /// identity. Returns whether the swap happened.
    pub(crate) fn cas(&self, key: &K, expect: &Entry<K, V>, new: Entry<K, V>) -> bool {
        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(current) if current.same_entry(expect) => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    /// Number of mapped keys. Approximate under concurrent mutation.
    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Append all keys to `out`.
    pub(crate) fn keys_into(&self, out: &mut Vec<K>) {
        out.extend(self.map.read().keys().cloned());
    }

    /// Append matching `(key, entry)` pairs to `out` until it holds `need`
    /// entries, walking the map from a seed-dependent offset with
    /// wrap-around so repeated sampling does not always favor the same
    /// keys.
    pub(crate) fn sample_into<F>(
        &self,
        out: &mut Vec<(K, Entry<K, V>)>,
        need: usize,
        seed: usize,
        filter: F,
    ) where
        F: Fn(&Entry<K, V>) -> bool,
    {
        if out.len() >= need {
            return;
        }
        let map = self.map.read();
        if map.is_empty() {
            return;
        }
        let start = seed % map.len();
        for (key, entry) in map.iter().skip(start).chain(map.iter().take(start)) {
            if filter(entry) {
                out.push((key.clone(), entry.clone()));
                if out.len() >= need {
                    return;
                }
            }
        }
    }

    /// Remove every mapping, appending the displaced entries to `out`.
    pub(crate) fn drain_into(&self, out: &mut Vec<Entry<K, V>>) {
        out.extend(self.map.write().drain().map(|(_, entry)| entry));
    }
}
