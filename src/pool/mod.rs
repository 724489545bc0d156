//! Shared resource pools and per-cache accessors.
//!
//! A [`Pool`] is an aggregate `(current size, maximum size)` budget shared
//! by any number of caches. Each attached cache accounts its contribution
//! through a [`PoolAccessor`], whose `add`/`delete`/`replace` operations
//! return the delta charged or a typed rejection. When a charge pushes the
//! pool over its maximum, the pool invokes the balanced evictor against the
//! registered [`PoolParticipant`]s before deciding whether to reject.
//!
//! Accounting here is pure bookkeeping: the pool performs no I/O and never
//! mutates a store directly — eviction is delegated through the
//! participants' `evict` entry points.

use crate::eviction::BalancedEvictor;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Result of a pool charge attempt.
///
/// Capacity exhaustion is an operating condition, not an error: a rejected
/// charge leaves the pool unchanged and the caller decides whether to
/// evict-and-retry or drop the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// The charge was applied; the payload is the net delta in bytes
    /// (negative for shrinking replaces).
    Accepted(i64),
    /// The charge could not be satisfied and `force` was not requested.
    /// Nothing was charged; for `replace`, the old charge is left in place.
    Rejected,
}

impl Charge {
    /// Whether the charge was applied.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Charge::Accepted(_))
    }

    /// The charged delta, if accepted.
    pub fn delta(&self) -> Option<i64> {
        match self {
            Charge::Accepted(delta) => Some(*delta),
            Charge::Rejected => None,
        }
    }
}

/// Computes the pool charge for an element.
///
/// The sizing seam is pluggable so deployments can charge deep sizes,
/// serialized sizes, or flat per-element counts. Returning `None` reports a
/// sizing failure, which rejects the charge.
pub trait ElementSizer<K, V>: Send + Sync {
    /// Size of the given key/value pair in pool units, or `None` when the
    /// pair cannot be sized.
    fn size_of(&self, key: &K, value: &V) -> Option<u64>;
}

/// Sizer charging one unit per element, turning a byte pool into an
/// element-count pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountSizer;

impl<K, V> ElementSizer<K, V> for CountSizer {
    fn size_of(&self, _key: &K, _value: &V) -> Option<u64> {
        Some(1)
    }
}

/// Sizer charging the shallow in-memory size of the key and value types.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShallowSizer;

impl<K, V> ElementSizer<K, V> for ShallowSizer {
    fn size_of(&self, _key: &K, _value: &V) -> Option<u64> {
        Some((std::mem::size_of::<K>() + std::mem::size_of::<V>()) as u64)
    }
}

/// A cache's participation in a shared pool, from the evictor's point of
/// view.
///
/// Participants expose the statistics the balanced evictor ranks on, and an
/// `evict` entry point through which the pool reclaims space.
pub trait PoolParticipant: Send + Sync {
    /// Total hits recorded against the participating store.
    fn hit_count(&self) -> u64;

    /// Total misses recorded against the participating store.
    fn miss_count(&self) -> u64;

    /// Number of elements the participant holds against this pool.
    fn count_size(&self) -> u64;

    /// Bytes the participant holds against this pool.
    fn byte_size(&self) -> u64;

    /// Attempt to evict roughly `count` elements or `bytes` bytes.
    ///
    /// Returns whether any space was released.
    fn evict(&self, count: u64, bytes: u64) -> bool;
}

struct Registration {
    id: u64,
    participant: Weak<dyn PoolParticipant>,
}

pub(crate) struct PoolInner {
    used: AtomicI64,
    max: AtomicI64,
    next_id: AtomicU64,
    registry: RwLock<Vec<Registration>>,
    evictor: BalancedEvictor,
}

impl PoolInner {
    /// Live participants as a point-in-time snapshot. Registrations made
    /// during an eviction scan may or may not be observed by that scan.
    fn participants(&self) -> Vec<Arc<dyn PoolParticipant>> {
        let registry = self.registry.read();
        let mut live = Vec::with_capacity(registry.len());
        let mut dead = false;
        for reg in registry.iter() {
            match reg.participant.upgrade() {
                Some(p) => live.push(p),
                None => dead = true,
            }
        }
        drop(registry);
        if dead {
            self.registry
                .write()
                .retain(|reg| reg.participant.strong_count() > 0);
        }
        live
    }

    fn free_space(&self, bytes: u64) -> bool {
        let participants = self.participants();
        let average = if participants.is_empty() {
            0.0
        } else {
            self.max.load(Ordering::Acquire) as f64 / participants.len() as f64
        };
        self.evictor.free_space(&participants, bytes, average)
    }
}

/// A shared `(current, maximum)` resource budget.
///
/// Cloning a `Pool` clones a handle to the same budget. The pool holds only
/// weak references to its participants, so it never keeps a detached cache
/// alive; caches detach their accessor before being dropped.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with the given maximum size in bytes (or elements,
    /// when the attached sizers are count-based).
    pub fn new(max_size: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                used: AtomicI64::new(0),
                max: AtomicI64::new(max_size as i64),
                next_id: AtomicU64::new(0),
                registry: RwLock::new(Vec::new()),
                evictor: BalancedEvictor::new(),
            }),
        }
    }

    /// Current pool occupancy.
    pub fn size(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire).max(0) as u64
    }

    /// Configured maximum.
    pub fn max_size(&self) -> u64 {
        self.inner.max.load(Ordering::Acquire).max(0) as u64
    }

    /// Change the maximum size.
    ///
    /// Decreasing the maximum synchronously runs the evictor for the
    /// difference before returning, so `size() <= max_size()` holds on
    /// return whenever the evictor could satisfy the shortfall (best
    /// effort; a shortfall is visible through `size()`).
    pub fn set_max_size(&self, new_size: u64) {
        let old = self.inner.max.swap(new_size as i64, Ordering::AcqRel);
        let new = new_size as i64;
        if new < old {
            self.inner.free_space((old - new) as u64);
        }
    }

    /// Run the evictor to free `bytes` across all registered participants.
    ///
    /// Returns `false` when a full pass over every participant freed
    /// nothing. The pool does not retry; escalation belongs to the caller.
    pub fn free_space(&self, bytes: u64) -> bool {
        self.inner.free_space(bytes)
    }

    /// Number of live participants.
    pub fn participant_count(&self) -> usize {
        self.inner.participants().len()
    }

    /// Attach a participating store, returning its accounting accessor.
    pub fn attach<K, V>(
        &self,
        participant: Arc<dyn PoolParticipant>,
        sizer: Arc<dyn ElementSizer<K, V>>,
    ) -> PoolAccessor<K, V> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registry.write().push(Registration {
            id,
            participant: Arc::downgrade(&participant),
        });
        PoolAccessor {
            pool: Arc::clone(&self.inner),
            registration: id,
            _participant: participant,
            sizer,
            local: AtomicI64::new(0),
        }
    }
}

/// One cache's accounting handle into a [`Pool`].
///
/// Created by [`Pool::attach`]; detaching removes the cache from the
/// pool's registry and must happen before the cache is destroyed (dropping
/// the accessor detaches implicitly).
pub struct PoolAccessor<K, V> {
    pool: Arc<PoolInner>,
    registration: u64,
    _participant: Arc<dyn PoolParticipant>,
    sizer: Arc<dyn ElementSizer<K, V>>,
    local: AtomicI64,
}

impl<K, V> PoolAccessor<K, V> {
    /// Charge the pool for a new element.
    ///
    /// `overhead` covers per-entry container cost beyond the sized key and
    /// value. With `force` the charge always succeeds, even over budget.
    /// On [`Charge::Rejected`] nothing was charged and the caller must leave
    /// (or make) the logical key absent.
    pub fn add(&self, key: &K, value: &V, overhead: u64, force: bool) -> Charge {
        match self.sizer.size_of(key, value) {
            Some(size) => self.charge(size + overhead, force),
            None => Charge::Rejected,
        }
    }

    /// Release `size` bytes previously charged through this accessor.
    pub fn delete(&self, size: u64) {
        self.pool.used.fetch_sub(size as i64, Ordering::AcqRel);
        self.local.fetch_sub(size as i64, Ordering::AcqRel);
    }

    /// Atomically swap a charge of `current_size` for a charge covering the
    /// given key/value pair, returning the net delta.
    ///
    /// On rejection the old charge is left in place — the caller must not
    /// assume the swap happened.
    pub fn replace(
        &self,
        current_size: u64,
        key: &K,
        value: &V,
        overhead: u64,
        force: bool,
    ) -> Charge {
        let new_size = match self.sizer.size_of(key, value) {
            Some(size) => size + overhead,
            None => return Charge::Rejected,
        };
        let delta = new_size as i64 - current_size as i64;
        if delta <= 0 {
            self.pool.used.fetch_add(delta, Ordering::AcqRel);
            self.local.fetch_add(delta, Ordering::AcqRel);
            Charge::Accepted(delta)
        } else {
            self.charge(delta as u64, force)
        }
    }

    /// Charge a raw size against the pool, bypassing the sizer. Used for
    /// charges whose exact size is known (serialized disk records).
    pub fn charge(&self, size: u64, force: bool) -> Charge {
        let delta = size as i64;
        let new = self.pool.used.fetch_add(delta, Ordering::AcqRel) + delta;
        let max = self.pool.max.load(Ordering::Acquire);
        if !force && new > max {
            let needed = (new - max) as u64;
            self.pool.free_space(needed);
            if self.pool.used.load(Ordering::Acquire) > max {
                self.pool.used.fetch_sub(delta, Ordering::AcqRel);
                return Charge::Rejected;
            }
        }
        self.local.fetch_add(delta, Ordering::AcqRel);
        Charge::Accepted(delta)
    }

    /// Outstanding bytes charged through this accessor.
    pub fn local_size(&self) -> u64 {
        self.local.load(Ordering::Acquire).max(0) as u64
    }

    /// Current pool occupancy.
    pub fn pool_size(&self) -> u64 {
        self.pool.used.load(Ordering::Acquire).max(0) as u64
    }

    /// Remove this accessor's registration from the pool.
    pub fn detach(&self) {
        self.pool
            .registry
            .write()
            .retain(|reg| reg.id != self.registration);
    }
}

impl<K, V> Drop for PoolAccessor<K, V> {
    fn drop(&mut self) {
        self.detach();
    }
}
