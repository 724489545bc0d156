//! Cache element representation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Expiration sentinel for elements that never expire.
pub const ETERNAL: u32 = u32::MAX;

/// Trait bound bundle for keys stored in a compound store.
pub trait CacheKey:
    Eq + Hash + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheKey for T where
    T: Eq + Hash + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Trait bound bundle for values stored in a compound store.
pub trait CacheValue: Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Current time as coarse seconds since the unix epoch.
pub(crate) fn now_secs() -> u32 {
    clocksource::coarse::UnixInstant::now()
        .duration_since(clocksource::coarse::UnixInstant::EPOCH)
        .as_secs()
}

/// A keyed cache element.
///
/// An element is a snapshot of `(key, value, creation time, last access
/// time, TTL/TTI, version, hit count)`. The key, value, and timing policy
/// are immutable once constructed; only the access statistics (hit count,
/// last access time) advance, through interior atomics.
///
/// Elements are owned by whichever tier currently holds them. Moving an
/// element between tiers re-owns a serialized copy rather than sharing a
/// reference, which is why the type is `Serialize + Deserialize`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Element<K, V> {
    key: K,
    value: V,
    version: u64,
    creation_time: u32,
    last_access_time: AtomicU32,
    ttl_secs: u32,
    tti_secs: u32,
    hit_count: AtomicU64,
    /// Transient flag carried by elements holding an uncommitted soft-locked
    /// value. Not persisted; a disk round-trip clears it.
    #[serde(skip)]
    soft_locked: bool,
}

impl<K, V> Element<K, V> {
    /// Create a new element with no expiration.
    pub fn new(key: K, value: V) -> Self {
        let now = now_secs();
        Self {
            key,
            value,
            version: 1,
            creation_time: now,
            last_access_time: AtomicU32::new(now),
            ttl_secs: 0,
            tti_secs: 0,
            hit_count: AtomicU64::new(0),
            soft_locked: false,
        }
    }

    /// Set the time-to-live in seconds (`0` = eternal).
    pub fn with_ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Set the time-to-idle in seconds (`0` = eternal).
    pub fn with_tti(mut self, tti_secs: u32) -> Self {
        self.tti_secs = tti_secs;
        self
    }

    /// Set the element version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Flag this element as holding an uncommitted soft-locked value.
    ///
    /// A soft-locked element written to the disk tier keeps a transient
    /// in-memory override on its marker so the lock holder's own reads see
    /// the uncommitted value without a disk round-trip.
    pub fn with_soft_lock(mut self, soft_locked: bool) -> Self {
        self.soft_locked = soft_locked;
        self
    }

    /// The element key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The element value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The element version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creation time in coarse seconds since the unix epoch.
    pub fn creation_time(&self) -> u32 {
        self.creation_time
    }

    /// Last access time in coarse seconds since the unix epoch.
    pub fn last_access_time(&self) -> u32 {
        self.last_access_time.load(Ordering::Relaxed)
    }

    /// Number of hits recorded against this element.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Whether this element carries an uncommitted soft-locked value.
    pub fn is_soft_locked(&self) -> bool {
        self.soft_locked
    }

    /// Fill in timing defaults for an element that carries none.
    pub(crate) fn apply_default_timing(&mut self, ttl_secs: u32, tti_secs: u32) {
        if self.ttl_secs == 0 {
            self.ttl_secs = ttl_secs;
        }
        if self.tti_secs == 0 {
            self.tti_secs = tti_secs;
        }
    }

    /// Record a hit: increments the hit count and refreshes the last access
    /// time.
    pub fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_time.store(now_secs(), Ordering::Relaxed);
    }

    /// Expiration time in coarse seconds, or [`ETERNAL`].
    ///
    /// The earlier of `creation + ttl` and `last access + tti`; a zero
    /// ttl/tti contributes no bound.
    pub fn expiration_time(&self) -> u32 {
        let ttl_expiry = if self.ttl_secs == 0 {
            ETERNAL
        } else {
            self.creation_time.saturating_add(self.ttl_secs)
        };
        let tti_expiry = if self.tti_secs == 0 {
            ETERNAL
        } else {
            self.last_access_time().saturating_add(self.tti_secs)
        };
        ttl_expiry.min(tti_expiry)
    }

    /// Whether the element is expired at time `now` (coarse seconds).
    pub fn is_expired(&self, now: u32) -> bool {
        now >= self.expiration_time() && self.expiration_time() != ETERNAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eternal_by_default() {
        let e = Element::new("key", 1u32);
        assert_eq!(e.expiration_time(), ETERNAL);
        assert!(!e.is_expired(now_secs()));
        assert!(!e.is_expired(ETERNAL - 1));
    }

    #[test]
    fn test_ttl_expiry() {
        let e = Element::new("key", 1u32).with_ttl(10);
        let expiry = e.creation_time() + 10;
        assert_eq!(e.expiration_time(), expiry);
        assert!(!e.is_expired(expiry - 1));
        assert!(e.is_expired(expiry));
    }

    #[test]
    fn test_tti_refreshed_by_hit() {
        let e = Element::new("key", 1u32).with_tti(30);
        let first = e.expiration_time();
        e.record_hit();
        assert!(e.expiration_time() >= first);
        assert_eq!(e.hit_count(), 1);
    }

    #[test]
    fn test_ttl_and_tti_earlier_wins() {
        let e = Element::new("key", 1u32).with_ttl(5).with_tti(60);
        assert_eq!(e.expiration_time(), e.creation_time() + 5);
    }

    #[test]
    fn test_serialization_drops_soft_lock() {
        let e = Element::new("key".to_string(), 7u64).with_soft_lock(true);
        assert!(e.is_soft_locked());
        let bytes = bincode::serialize(&e).unwrap();
        let back: Element<String, u64> = bincode::deserialize(&bytes).unwrap();
        assert!(!back.is_soft_locked());
        assert_eq!(back.key(), "key");
        assert_eq!(*back.value(), 7);
    }
}
