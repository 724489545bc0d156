//! Compound store: one key→element map spanning the memory and disk tiers.
//!
//! Every key lives in exactly one segment, and every entry is either the
//! element itself (memory tier) or a substitute for it (disk tier). The
//! per-key state machine is:
//!
//! ```text
//! Absent -> Resident(memory) <-> Placeholder -> Marker <-> Resident(faulted) -> Absent
//! ```
//!
//! All transitions hold the key's write lock except the read-only "fault a
//! copy into memory" transition, which proceeds under the read lock: the
//! memory copy is a cache of the disk copy, not a move, so installing it
//! removes nothing. Both fault directions are compare-and-swaps against
//! the expected entry's identity, so no reader ever observes a key with
//! neither representation.
//!
//! Pool charges wrap structural mutations: the charge happens before the
//! mutation is considered committed and is unwound whenever the mutation
//! fails or the entry is later freed.

use crate::config::StoreConfig;
use crate::disk::factory::{DiskFactory, MAX_EVICT, SAMPLE_SIZE};
use crate::disk::substitute::{DiskMarker, Entry};
use crate::element::{now_secs, CacheKey, CacheValue, Element};
use crate::error::{StoreError, StoreResult};
use crate::listener::{NullListener, StoreListener};
use crate::nonstop::{NonstopKeyLock, TopologyEpoch};
use crate::pool::{Charge, ElementSizer, Pool, PoolAccessor, PoolParticipant};
use crate::store::segment::Segment;
use crate::sync::{KeyLock, LockMode};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// The tier currently holding a key, as observable from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Element is resident in the memory tier.
    Memory,
    /// Element is in-flight to disk (placeholder installed).
    InFlight,
    /// Element is resident on disk (marker installed).
    Disk,
}

enum MemoryCreate<K, V> {
    Created(Entry<K, V>),
    /// The pool rejected the charge; nothing was created.
    Rejected,
}

pub(crate) struct StoreInner<K, V> {
    segments: Box<[Segment<K, V>]>,
    hasher: ahash::RandomState,
    memory_capacity: usize,
    memory_count: AtomicUsize,
    disk: DiskFactory<K, V>,
    heap_accessor: OnceLock<PoolAccessor<K, V>>,
    disk_accessor: OnceLock<PoolAccessor<K, V>>,
    listener: Arc<dyn StoreListener<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    disposed: AtomicBool,
    default_ttl: u32,
    default_tti: u32,
    nonstop_timeout: Duration,
    topology: Arc<TopologyEpoch>,
}

impl<K, V> StoreInner<K, V> {
    pub(crate) fn disk(&self) -> &DiskFactory<K, V> {
        &self.disk
    }

    fn ensure_alive(&self) -> StoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StoreError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Shut down the disk tier and detach from any pools. Idempotent.
    pub(crate) fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.disk.shutdown();
            if let Some(accessor) = self.heap_accessor.get() {
                accessor.detach();
            }
            if let Some(accessor) = self.disk_accessor.get() {
                accessor.detach();
            }
        }
    }
}

impl<K, V> Drop for StoreInner<K, V> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<K: CacheKey, V: CacheValue> StoreInner<K, V> {
    fn segment_index(&self, key: &K) -> usize {
        let hash = self.hasher.hash_one(key);
        (hash as usize) & (self.segments.len() - 1)
    }

    pub(crate) fn segment_for(&self, key: &K) -> &Segment<K, V> {
        &self.segments[self.segment_index(key)]
    }

    /// Decode an entry back into its element.
    ///
    /// For markers this reads the data file; when `key` is given the
    /// element is opportunistically faulted back into the memory tier —
    /// through the non-blocking try path for markers (losing a race is
    /// silent), through the blocking path for placeholders (the element is
    /// already in memory, so installing it costs nothing).
    fn decode(
        &self,
        key: Option<&K>,
        entry: &Entry<K, V>,
        record_hit: bool,
    ) -> StoreResult<Arc<Element<K, V>>> {
        match entry {
            Entry::Resident { element, .. } => {
                if record_hit {
                    element.record_hit();
                }
                Ok(Arc::clone(element))
            }
            Entry::Placeholder(placeholder) => {
                let element = Arc::clone(placeholder.element());
                if record_hit {
                    element.record_hit();
                }
                if let Some(key) = key {
                    self.fault_into_memory(key, entry, &element, true);
                }
                Ok(element)
            }
            Entry::Marker(marker) => {
                let element = self.disk.read_marker(marker)?;
                if record_hit {
                    marker.hit(&element);
                }
                if let Some(key) = key {
                    self.fault_into_memory(key, entry, &element, false);
                }
                Ok(element)
            }
        }
    }

    /// Copy `element` into the memory tier in place of its substitute.
    fn fault_into_memory(
        &self,
        key: &K,
        current: &Entry<K, V>,
        element: &Arc<Element<K, V>>,
        blocking: bool,
    ) {
        match self.memory_create(key, Arc::clone(element)) {
            MemoryCreate::Created(fresh) => {
                if blocking {
                    self.fault(key, current, fresh);
                } else {
                    self.try_fault(key, current, fresh);
                }
            }
            MemoryCreate::Rejected => {
                // over budget; the element stays represented on disk
            }
        }
    }

    /// Create a memory-tier entry for `element`, charging the heap pool and
    /// overflowing older residents to disk when over capacity.
    fn memory_create(&self, key: &K, element: Arc<Element<K, V>>) -> MemoryCreate<K, V> {
        let charged = match self.heap_accessor.get() {
            Some(accessor) => match accessor.add(key, element.value(), 0, false) {
                Charge::Accepted(delta) => delta.max(0) as u64,
                Charge::Rejected => return MemoryCreate::Rejected,
            },
            None => 0,
        };
        let count = self.memory_count.fetch_add(1, Ordering::AcqRel) + 1;
        if self.memory_capacity > 0 && count > self.memory_capacity {
            self.overflow_from_memory(count - self.memory_capacity, Some(key));
        }
        MemoryCreate::Created(Entry::Resident { element, charged })
    }

    /// Move up to `min(MAX_EVICT, excess)` sampled residents to disk.
    fn overflow_from_memory(&self, excess: usize, key_hint: Option<&K>) {
        for _ in 0..excess.min(MAX_EVICT) {
            let target = self.eviction_target(SAMPLE_SIZE, key_hint, |entry| {
                matches!(entry, Entry::Resident { .. })
            });
            match target {
                Some((victim, entry)) => {
                    self.overflow_entry(&victim, &entry);
                    if self.memory_count.load(Ordering::Acquire) <= self.memory_capacity {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Substitute a resident entry with a disk placeholder, scheduling its
    /// write. A non-serializable element is evicted outright instead.
    ///
    /// The swap goes through the try path: overflow can run while the
    /// caller holds another key's lock, so it must never block on the
    /// victim's lock. A busy victim just stays resident this round.
    pub(crate) fn overflow_entry(&self, key: &K, entry: &Entry<K, V>) -> bool {
        let Entry::Resident { element, .. } = entry else {
            return false;
        };
        match self.disk.create(self, key, element) {
            Ok(placeholder_entry) => {
                if self.try_fault(key, entry, placeholder_entry.clone()) {
                    if let Entry::Placeholder(placeholder) = placeholder_entry {
                        self.disk.installed(key.clone(), placeholder);
                    }
                    true
                } else {
                    false
                }
            }
            Err(err) => {
                log::debug!("overflow to disk rejected, evicting element instead: {err}");
                self.evict_entry(key, Some(entry))
            }
        }
    }

    /// Release the counters, pool charges, and disk space an entry holds.
    ///
    /// Called exactly once per entry removed from (or never installed
    /// into) the map, while the caller still holds the key's lock. A
    /// marker's file region is recycled immediately when the write lock is
    /// available and through the writer thread otherwise, so no reader can
    /// be mid-read on a recycled region.
    pub(crate) fn free_entry(&self, entry: &Entry<K, V>) {
        match entry {
            Entry::Resident { charged, .. } => {
                self.memory_count.fetch_sub(1, Ordering::AcqRel);
                if let Some(accessor) = self.heap_accessor.get() {
                    accessor.delete(*charged);
                }
            }
            Entry::Placeholder(_) => self.disk.free_placeholder(),
            Entry::Marker(marker) => {
                self.disk.release_marker();
                if let Some(accessor) = self.disk_accessor.get() {
                    accessor.delete(marker.size() as u64);
                }
                let segment = self.segment_for(marker.key());
                if let Some(_guard) = segment.lock().try_guard(LockMode::Write, Duration::ZERO) {
                    self.disk.free_region(marker);
                } else {
                    self.disk.schedule_region_free(Arc::clone(marker));
                }
            }
        }
    }

    /// Complete a deferred marker region free under the key's write lock.
    pub(crate) fn complete_region_free(&self, marker: &Arc<DiskMarker<K, V>>) {
        let segment = self.segment_for(marker.key());
        let _guard = segment.lock().write_guard();
        self.disk.free_region(marker);
    }

    /// Force-charge the disk pool for a completed write.
    pub(crate) fn charge_disk(&self, size: u64) {
        if let Some(accessor) = self.disk_accessor.get() {
            let _ = accessor.charge(size, true);
        }
    }

    /// Fill in the configured TTL/TTI for elements that carry none.
    fn with_default_timing(&self, mut element: Element<K, V>) -> Element<K, V> {
        element.apply_default_timing(self.default_ttl, self.default_tti);
        element
    }

    pub(crate) fn put(&self, element: Element<K, V>) -> StoreResult<bool> {
        self.ensure_alive()?;
        let element = self.with_default_timing(element);
        let key = element.key().clone();
        let element = Arc::new(element);
        let entry = match self.memory_create(&key, Arc::clone(&element)) {
            MemoryCreate::Created(entry) => entry,
            MemoryCreate::Rejected => {
                // rejected adds evict the candidate and record the eviction
                let absent = !self.contains_key(&key);
                self.listener.element_evicted(&element);
                return Ok(absent);
            }
        };

        let segment = self.segment_for(&key);
        let mut decode_failure = None;
        let (was_absent, old_element) = {
            let _guard = segment.lock().write_guard();
            let old = segment.insert(key, entry);
            let old_element = old.as_ref().and_then(|o| match self.decode(None, o, false) {
                Ok(e) => Some(e),
                Err(err) => {
                    decode_failure = Some(err);
                    None
                }
            });
            if let Some(old) = &old {
                self.free_entry(old);
            }
            (old.is_none(), old_element)
        };
        if let Some(err) = decode_failure {
            return Err(err);
        }
        if let Some(old_element) = &old_element {
            self.listener.element_removed(old_element);
        }
        self.listener.element_put(&element);
        Ok(was_absent)
    }

    pub(crate) fn put_if_absent(
        &self,
        element: Element<K, V>,
    ) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.ensure_alive()?;
        let element = self.with_default_timing(element);
        let key = element.key().clone();
        let element = Arc::new(element);
        let entry = match self.memory_create(&key, Arc::clone(&element)) {
            MemoryCreate::Created(entry) => entry,
            MemoryCreate::Rejected => {
                self.listener.element_evicted(&element);
                return Ok(None);
            }
        };

        let segment = self.segment_for(&key);
        let existing = {
            let _guard = segment.lock().write_guard();
            match segment.try_insert(&key, &entry) {
                None => None,
                Some(existing) => {
                    self.free_entry(&entry);
                    Some(self.decode(Some(&key), &existing, false))
                }
            }
        };
        match existing {
            None => {
                self.listener.element_put(&element);
                Ok(None)
            }
            Some(decoded) => decoded.map(Some),
        }
    }

    pub(crate) fn get(&self, key: &K) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.ensure_alive()?;
        let segment = self.segment_for(key);
        let looked_up = {
            let _guard = segment.lock().read_guard();
            match segment.entry(key) {
                None => None,
                Some(entry) => {
                    let element = self.decode(Some(key), &entry, true)?;
                    Some((entry, element))
                }
            }
        };
        match looked_up {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some((entry, element)) => {
                if element.is_expired(now_secs()) {
                    self.expire_entry(key, &entry, Some(&element));
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(element))
                }
            }
        }
    }

    /// Like `get`, without recording statistics or faulting into memory.
    pub(crate) fn get_quiet(&self, key: &K) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.ensure_alive()?;
        let segment = self.segment_for(key);
        let looked_up = {
            let _guard = segment.lock().read_guard();
            match segment.entry(key) {
                None => None,
                Some(entry) => Some((self.decode(None, &entry, false)?, entry)),
            }
        };
        match looked_up {
            None => Ok(None),
            Some((element, entry)) => {
                if element.is_expired(now_secs()) {
                    self.expire_entry(key, &entry, Some(&element));
                    Ok(None)
                } else {
                    Ok(Some(element))
                }
            }
        }
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        let segment = self.segment_for(key);
        let _guard = segment.lock().read_guard();
        segment.contains(key)
    }

    pub(crate) fn remove(&self, key: &K) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.ensure_alive()?;
        let segment = self.segment_for(key);
        let mut decode_failure = None;
        let old_element = {
            let _guard = segment.lock().write_guard();
            match segment.remove(key) {
                None => None,
                Some(old) => {
                    let element = match self.decode(None, &old, false) {
                        Ok(e) => Some(e),
                        Err(err) => {
                            decode_failure = Some(err);
                            None
                        }
                    };
                    self.free_entry(&old);
                    element
                }
            }
        };
        if let Some(err) = decode_failure {
            return Err(err);
        }
        if let Some(element) = &old_element {
            self.listener.element_removed(element);
        }
        Ok(old_element)
    }

    pub(crate) fn remove_element(
        &self,
        key: &K,
        value: &V,
    ) -> StoreResult<Option<Arc<Element<K, V>>>>
    where
        V: PartialEq,
    {
        self.ensure_alive()?;
        let segment = self.segment_for(key);
        let removed = {
            let _guard = segment.lock().write_guard();
            match segment.entry(key) {
                None => None,
                Some(entry) => {
                    let decoded = self.decode(None, &entry, false)?;
                    if decoded.value() == value {
                        segment.remove(key);
                        self.free_entry(&entry);
                        Some(decoded)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(element) = &removed {
            self.listener.element_removed(element);
        }
        Ok(removed)
    }

    /// Replace the mapping for this key only if one exists.
    pub(crate) fn replace(
        &self,
        element: Element<K, V>,
    ) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.ensure_alive()?;
        let element = self.with_default_timing(element);
        let key = element.key().clone();
        let element = Arc::new(element);
        let entry = match self.memory_create(&key, Arc::clone(&element)) {
            MemoryCreate::Created(entry) => entry,
            MemoryCreate::Rejected => {
                self.listener.element_evicted(&element);
                return Ok(None);
            }
        };

        let segment = self.segment_for(&key);
        let mut decode_failure = None;
        let old_element = {
            let _guard = segment.lock().write_guard();
            if segment.contains(&key) {
                let old = segment.insert(key, entry).expect("mapping vanished under write lock");
                let old_element = match self.decode(None, &old, false) {
                    Ok(e) => Some(e),
                    Err(err) => {
                        decode_failure = Some(err);
                        None
                    }
                };
                self.free_entry(&old);
                old_element
            } else {
                self.free_entry(&entry);
                None
            }
        };
        if let Some(err) = decode_failure {
            return Err(err);
        }
        if let Some(old_element) = &old_element {
            self.listener.element_removed(old_element);
            self.listener.element_put(&element);
        }
        Ok(old_element)
    }

    /// Replace the mapping only if it currently holds `old_value`.
    pub(crate) fn replace_element(
        &self,
        old_value: &V,
        element: Element<K, V>,
    ) -> StoreResult<bool>
    where
        V: PartialEq,
    {
        self.ensure_alive()?;
        let element = self.with_default_timing(element);
        let key = element.key().clone();
        let element = Arc::new(element);
        let entry = match self.memory_create(&key, Arc::clone(&element)) {
            MemoryCreate::Created(entry) => entry,
            MemoryCreate::Rejected => {
                self.listener.element_evicted(&element);
                return Ok(false);
            }
        };

        let segment = self.segment_for(&key);
        let replaced = {
            let _guard = segment.lock().write_guard();
            match segment.entry(&key) {
                Some(current) => {
                    let decoded = match self.decode(None, &current, false) {
                        Ok(e) => e,
                        Err(err) => {
                            self.free_entry(&entry);
                            return Err(err);
                        }
                    };
                    if decoded.value() == old_value {
                        segment.insert(key, entry);
                        self.free_entry(&current);
                        Some(decoded)
                    } else {
                        self.free_entry(&entry);
                        None
                    }
                }
                None => {
                    self.free_entry(&entry);
                    None
                }
            }
        };
        match replaced {
            Some(old_element) => {
                self.listener.element_removed(&old_element);
                self.listener.element_put(&element);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Atomically switch the `expect` representation of a key for `fault`,
    /// blocking on the key's read lock.
    ///
    /// A successful switch frees the replaced entry; a failed switch frees
    /// the entry that was not installed. Either way the caller must not
    /// free again.
    pub(crate) fn fault(&self, key: &K, expect: &Entry<K, V>, fault: Entry<K, V>) -> bool {
        let segment = self.segment_for(key);
        let swapped = {
            let _guard = segment.lock().read_guard();
            let swapped = segment.cas(key, expect, fault.clone());
            if swapped {
                self.free_entry(expect);
            }
            swapped
        };
        if !swapped {
            self.free_entry(&fault);
        }
        swapped
    }

    /// Non-blocking variant of [`fault`](Self::fault): silently does
    /// nothing when it loses the race for the read lock.
    pub(crate) fn try_fault(&self, key: &K, expect: &Entry<K, V>, fault: Entry<K, V>) -> bool {
        let segment = self.segment_for(key);
        let swapped = match segment.lock().try_guard(LockMode::Read, Duration::ZERO) {
            Some(_guard) => {
                let swapped = segment.cas(key, expect, fault.clone());
                if swapped {
                    self.free_entry(expect);
                }
                swapped
            }
            None => false,
        };
        if !swapped {
            self.free_entry(&fault);
        }
        swapped
    }

    /// Remove a key for capacity reasons, matching `expected` by identity.
    ///
    /// Takes the write lock through the try path: an entry that is busy is
    /// simply not evicted this round.
    pub(crate) fn evict_entry(&self, key: &K, expected: Option<&Entry<K, V>>) -> bool {
        let segment = self.segment_for(key);
        let evicted = {
            let Some(_guard) = segment.lock().try_guard(LockMode::Write, Duration::ZERO) else {
                return false;
            };
            let Some(current) = segment.entry(key) else {
                return false;
            };
            if let Some(expected) = expected {
                if !current.same_entry(expected) {
                    return false;
                }
            }
            let decoded = match self.decode(None, &current, false) {
                Ok(element) => Some(element),
                Err(err) => {
                    log::warn!("failed to decode element during eviction: {err}");
                    None
                }
            };
            segment.remove(key);
            self.free_entry(&current);
            decoded
        };
        if let Some(element) = &evicted {
            self.listener.element_evicted(element);
        }
        true
    }

    /// Remove an expired entry, matching `expected` by identity.
    pub(crate) fn expire_entry(
        &self,
        key: &K,
        expected: &Entry<K, V>,
        element: Option<&Arc<Element<K, V>>>,
    ) -> bool {
        let segment = self.segment_for(key);
        let expired = {
            let _guard = segment.lock().write_guard();
            let Some(current) = segment.entry(key) else {
                return false;
            };
            if !current.same_entry(expected) {
                return false;
            }
            let decoded = match element {
                Some(element) => Some(Arc::clone(element)),
                None => match self.decode(None, &current, false) {
                    Ok(element) => Some(element),
                    Err(err) => {
                        log::warn!("failed to decode element during expiry: {err}");
                        None
                    }
                },
            };
            segment.remove(key);
            self.free_entry(&current);
            decoded
        };
        if let Some(element) = &expired {
            self.listener.element_expired(element);
        }
        true
    }

    /// Select a random sample of entries matching `filter`, walking the
    /// segments starting from the hint key's segment.
    pub(crate) fn random_sample<F>(
        &self,
        need: usize,
        key_hint: Option<&K>,
        filter: F,
    ) -> Vec<(K, Entry<K, V>)>
    where
        F: Fn(&Entry<K, V>) -> bool,
    {
        if need == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(need.min(SAMPLE_SIZE));
        let seed = rand::random::<u64>() as usize;
        let mask = self.segments.len() - 1;
        let start = match key_hint {
            Some(key) => self.segment_index(key),
            None => seed & mask,
        };
        for i in 0..self.segments.len() {
            self.segments[(start + i) & mask].sample_into(&mut out, need, seed, &filter);
            if out.len() >= need {
                break;
            }
        }
        out
    }

    /// Pick the sampled entry with the lowest hit count, preferring any
    /// candidate over the hinted key (which is only evicted when the
    /// sample holds nothing else).
    pub(crate) fn eviction_target<F>(
        &self,
        sample_cap: usize,
        key_hint: Option<&K>,
        filter: F,
    ) -> Option<(K, Entry<K, V>)>
    where
        F: Fn(&Entry<K, V>) -> bool,
    {
        let sample = self.random_sample(sample_cap, key_hint, filter);
        let mut target: Option<&(K, Entry<K, V>)> = None;
        let mut hint_target: Option<&(K, Entry<K, V>)> = None;
        for candidate in &sample {
            let better = match target {
                None => true,
                Some(current) => candidate.1.hit_count() < current.1.hit_count(),
            };
            if better {
                if Some(&candidate.0) == key_hint {
                    hint_target = Some(candidate);
                } else {
                    target = Some(candidate);
                }
            }
        }
        target.or(hint_target).cloned()
    }

    /// All keys currently represented by a substitute.
    pub(crate) fn substitute_snapshot(&self) -> Vec<(K, Entry<K, V>)> {
        let mut out = Vec::new();
        for segment in self.segments.iter() {
            segment.sample_into(&mut out, usize::MAX, 0, Entry::is_substitute);
        }
        out
    }

    /// Overflow up to `count` sampled residents to disk, freeing heap.
    pub(crate) fn evict_from_heap(&self, count: u64) -> bool {
        let mut any = false;
        for _ in 0..count.max(1) {
            let target = self.eviction_target(SAMPLE_SIZE, None, |entry| {
                matches!(entry, Entry::Resident { .. })
            });
            match target {
                Some((key, entry)) => any |= self.overflow_entry(&key, &entry),
                None => break,
            }
        }
        any
    }

    /// Evict up to `count` sampled disk substitutes outright.
    pub(crate) fn evict_from_disk(&self, count: u64) -> bool {
        let mut any = false;
        for _ in 0..count.max(1) {
            match self.eviction_target(SAMPLE_SIZE, None, Entry::is_substitute) {
                Some((key, entry)) => any |= self.evict_entry(&key, Some(&entry)),
                None => break,
            }
        }
        any
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        for segment in self.segments.iter() {
            segment.keys_into(&mut out);
        }
        out
    }

    pub(crate) fn clear(&self) {
        let mut freed = Vec::new();
        for segment in self.segments.iter() {
            let _guard = segment.lock().write_guard();
            segment.drain_into(&mut freed);
            for entry in freed.drain(..) {
                self.free_entry(&entry);
            }
        }
    }

    pub(crate) fn tier_of(&self, key: &K) -> Option<Tier> {
        let segment = self.segment_for(key);
        let _guard = segment.lock().read_guard();
        segment.entry(key).map(|entry| match entry {
            Entry::Resident { .. } => Tier::Memory,
            Entry::Placeholder(_) => Tier::InFlight,
            Entry::Marker(_) => Tier::Disk,
        })
    }
}

/// Heap-side pool participation of one store.
struct HeapParticipant<K, V>(Weak<StoreInner<K, V>>);

impl<K: CacheKey, V: CacheValue> PoolParticipant for HeapParticipant<K, V> {
    fn hit_count(&self) -> u64 {
        self.0.upgrade().map_or(0, |s| s.hits.load(Ordering::Relaxed))
    }

    fn miss_count(&self) -> u64 {
        self.0
            .upgrade()
            .map_or(0, |s| s.misses.load(Ordering::Relaxed))
    }

    fn count_size(&self) -> u64 {
        self.0
            .upgrade()
            .map_or(0, |s| s.memory_count.load(Ordering::Acquire) as u64)
    }

    fn byte_size(&self) -> u64 {
        self.0
            .upgrade()
            .map_or(0, |s| s.heap_accessor.get().map_or(0, |a| a.local_size()))
    }

    fn evict(&self, count: u64, _bytes: u64) -> bool {
        self.0.upgrade().is_some_and(|s| s.evict_from_heap(count))
    }
}

/// Disk-side pool participation of one store.
struct DiskParticipant<K, V>(Weak<StoreInner<K, V>>);

impl<K: CacheKey, V: CacheValue> PoolParticipant for DiskParticipant<K, V> {
    fn hit_count(&self) -> u64 {
        self.0.upgrade().map_or(0, |s| s.hits.load(Ordering::Relaxed))
    }

    fn miss_count(&self) -> u64 {
        self.0
            .upgrade()
            .map_or(0, |s| s.misses.load(Ordering::Relaxed))
    }

    fn count_size(&self) -> u64 {
        self.0.upgrade().map_or(0, |s| s.disk.size() as u64)
    }

    fn byte_size(&self) -> u64 {
        self.0
            .upgrade()
            .map_or(0, |s| s.disk_accessor.get().map_or(0, |a| a.local_size()))
    }

    fn evict(&self, count: u64, _bytes: u64) -> bool {
        self.0.upgrade().is_some_and(|s| s.evict_from_disk(count))
    }
}

/// Builder for a [`CompoundStore`].
pub struct StoreBuilder<K, V> {
    config: StoreConfig,
    listener: Arc<dyn StoreListener<K, V>>,
    on_heap_pool: Option<(Pool, Arc<dyn ElementSizer<K, V>>)>,
    on_disk_pool: Option<Pool>,
    topology: Arc<TopologyEpoch>,
}

impl<K: CacheKey, V: CacheValue> Default for StoreBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V: CacheValue> StoreBuilder<K, V> {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            listener: Arc::new(NullListener),
            on_heap_pool: None,
            on_disk_pool: None,
            topology: Arc::new(TopologyEpoch::new()),
        }
    }

    /// Use the given configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive mutation notifications on `listener`.
    pub fn listener(mut self, listener: Arc<dyn StoreListener<K, V>>) -> Self {
        self.listener = listener;
        self
    }

    /// Share the given heap pool, charging elements through `sizer`.
    pub fn on_heap_pool(mut self, pool: &Pool, sizer: Arc<dyn ElementSizer<K, V>>) -> Self {
        self.on_heap_pool = Some((pool.clone(), sizer));
        self
    }

    /// Share the given disk pool; charges are exact serialized byte sizes.
    pub fn on_disk_pool(mut self, pool: &Pool) -> Self {
        self.on_disk_pool = Some(pool.clone());
        self
    }

    /// Observe cluster topology changes through `topology`.
    pub fn topology(mut self, topology: Arc<TopologyEpoch>) -> Self {
        self.topology = topology;
        self
    }

    /// Open the data file, start the writer thread, and attach pools.
    pub fn build(self) -> StoreResult<CompoundStore<K, V>> {
        let stripes = self.config.stripes();
        let segments: Box<[Segment<K, V>]> = (0..stripes).map(|_| Segment::new()).collect();
        let disk = DiskFactory::new(&self.config)?;
        let inner = Arc::new(StoreInner {
            segments,
            hasher: ahash::RandomState::new(),
            memory_capacity: self.config.memory_capacity,
            memory_count: AtomicUsize::new(0),
            disk,
            heap_accessor: OnceLock::new(),
            disk_accessor: OnceLock::new(),
            listener: self.listener,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            default_ttl: self.config.ttl_secs,
            default_tti: self.config.tti_secs,
            nonstop_timeout: self.config.nonstop_timeout,
            topology: self.topology,
        });
        inner.disk.bind(&inner);

        if let Some((pool, sizer)) = self.on_heap_pool {
            let participant: Arc<dyn PoolParticipant> =
                Arc::new(HeapParticipant(Arc::downgrade(&inner)));
            let accessor = pool.attach(participant, sizer);
            let _ = inner.heap_accessor.set(accessor);
        }
        if let Some(pool) = self.on_disk_pool {
            let participant: Arc<dyn PoolParticipant> =
                Arc::new(DiskParticipant(Arc::downgrade(&inner)));
            let accessor = pool.attach(participant, Arc::new(crate::pool::CountSizer));
            let _ = inner.disk_accessor.set(accessor);
        }

        Ok(CompoundStore { inner })
    }
}

/// A key→element store spanning an in-memory tier and a disk overflow
/// tier behind one API.
///
/// Writes land in the memory tier; when that tier is over capacity, cold
/// residents are substituted with placeholders and spooled to the data
/// file by a background writer. Reads transparently follow whichever
/// representation a key currently has, faulting disk-resident elements
/// back into memory.
pub struct CompoundStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> CompoundStore<K, V> {
    /// Start building a store.
    pub fn builder() -> StoreBuilder<K, V> {
        StoreBuilder::new()
    }

    /// Build a store from `config` with defaults for everything else.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        Self::builder().config(config).build()
    }

    /// Store `element`, replacing any existing mapping for its key.
    ///
    /// Returns whether the key was absent before the call.
    pub fn put(&self, element: Element<K, V>) -> StoreResult<bool> {
        self.inner.put(element)
    }

    /// Store `element` only if its key is unmapped; returns the existing
    /// element otherwise.
    pub fn put_if_absent(&self, element: Element<K, V>) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.inner.put_if_absent(element)
    }

    /// The element mapped to `key`, from whichever tier holds it.
    pub fn get(&self, key: &K) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.inner.get(key)
    }

    /// Like [`get`](Self::get) but without statistics, hit recording, or
    /// faulting.
    pub fn get_quiet(&self, key: &K) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.inner.get_quiet(key)
    }

    /// Whether `key` is mapped.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Remove and return the element mapped to `key`.
    pub fn remove(&self, key: &K) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.inner.remove(key)
    }

    /// Remove the mapping only if it currently holds `value`.
    pub fn remove_element(&self, key: &K, value: &V) -> StoreResult<Option<Arc<Element<K, V>>>>
    where
        V: PartialEq,
    {
        self.inner.remove_element(key, value)
    }

    /// Replace the mapping for the element's key only if one exists,
    /// returning the previous element.
    pub fn replace(&self, element: Element<K, V>) -> StoreResult<Option<Arc<Element<K, V>>>> {
        self.inner.replace(element)
    }

    /// Replace the mapping only if it currently holds `old_value`.
    pub fn replace_element(&self, old_value: &V, element: Element<K, V>) -> StoreResult<bool>
    where
        V: PartialEq,
    {
        self.inner.replace_element(old_value, element)
    }

    /// Number of mapped keys across all tiers.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store maps no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All mapped keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner.keys()
    }

    /// Number of elements resident in the memory tier.
    pub fn memory_len(&self) -> usize {
        self.inner.memory_count.load(Ordering::Acquire)
    }

    /// Number of elements represented on disk (including in-flight).
    pub fn disk_len(&self) -> usize {
        self.inner.disk.size()
    }

    /// Bytes of the data file covered by live records.
    pub fn on_disk_bytes(&self) -> u64 {
        self.inner.disk.occupied_len()
    }

    /// Whether the disk write spool is over its configured bound.
    pub fn buffer_full(&self) -> bool {
        self.inner.disk.buffer_full()
    }

    /// Change the maximum number of elements on disk (`0` = unbounded).
    pub fn set_disk_capacity(&self, capacity: usize) {
        self.inner.disk.set_capacity(capacity);
    }

    /// Block until every disk write spooled before this call has
    /// completed.
    ///
    /// Must not be called while holding a lock from
    /// [`sync_for_key`](Self::sync_for_key): the writer thread may need
    /// that lock to drain its queue.
    pub fn flush(&self) {
        self.inner.disk.flush();
    }

    /// Remove expired disk-resident elements now, firing expiry
    /// notifications.
    pub fn expire_elements(&self) {
        self.inner.disk.expiry_sweep(&self.inner);
    }

    /// Shrink the data file down to its live contents.
    pub fn shrink_data_file(&self) {
        self.inner.disk.shrink_data_file();
    }

    /// Remove every mapping. No per-element notifications fire.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Hits recorded by [`get`](Self::get).
    pub fn hit_count(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    /// Misses recorded by [`get`](Self::get).
    pub fn miss_count(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    /// The tier currently holding `key`.
    pub fn tier_of(&self, key: &K) -> Option<Tier> {
        self.inner.tier_of(key)
    }

    /// The lock guarding `key`, for callers that need explicit multi-step
    /// atomicity around store operations.
    pub fn sync_for_key(&self, key: &K) -> &KeyLock {
        self.inner.segment_for(key).lock()
    }

    /// Timeout-bounded view of the lock guarding `key`.
    pub fn nonstop_sync_for_key(&self, key: &K) -> NonstopKeyLock<'_> {
        NonstopKeyLock::new(
            self.sync_for_key(key),
            self.inner.nonstop_timeout,
            Arc::clone(&self.inner.topology),
        )
    }

    /// Shut down the disk tier, detach from pools, and reject further
    /// operations. The data file is deleted.
    ///
    /// Must not be called while holding a lock from
    /// [`sync_for_key`](Self::sync_for_key): shutdown joins the writer
    /// thread, which may need that lock to finish its queue.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}
