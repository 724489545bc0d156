//! In-memory stand-ins for elements moving between tiers.
//!
//! A key currently transitioning to (or resident on) disk is represented in
//! the store map by a substitute instead of the element itself:
//!
//! - [`Placeholder`]: the element is in-flight to disk. Holds the element
//!   and its serialized form; exists only between "evicted from memory" and
//!   "write completed".
//! - [`DiskMarker`]: the element is resident on disk. Holds the record's
//!   file position and byte length — never the payload — plus the hit count
//!   and expiration time needed for eviction and expiry decisions without a
//!   disk read.
//!
//! A key maps to at most one substitute at a time; the Placeholder→Marker
//! transition is a compare-and-swap against the expected substitute's
//! identity, so concurrent readers observe exactly one of the two.

use crate::element::Element;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// An element in-flight to disk.
pub(crate) struct Placeholder<K, V> {
    element: Arc<Element<K, V>>,
    serialized: Vec<u8>,
    failed_to_flush: AtomicBool,
}

impl<K, V> Placeholder<K, V> {
    pub(crate) fn new(element: Arc<Element<K, V>>, serialized: Vec<u8>) -> Self {
        Self {
            element,
            serialized,
            failed_to_flush: AtomicBool::new(false),
        }
    }

    /// The wrapped element.
    pub(crate) fn element(&self) -> &Arc<Element<K, V>> {
        &self.element
    }

    /// The element's serialized form, produced at creation time.
    pub(crate) fn serialized(&self) -> &[u8] {
        &self.serialized
    }

    /// Whether flushing this placeholder to disk has failed.
    pub(crate) fn has_failed_to_flush(&self) -> bool {
        self.failed_to_flush.load(Ordering::Acquire)
    }

    pub(crate) fn set_failed_to_flush(&self) {
        self.failed_to_flush.store(true, Ordering::Release);
    }
}

/// An element resident on disk: `(position, length)` into the data file.
///
/// Immutable once created except for hit-count and expiry refreshes.
pub(crate) struct DiskMarker<K, V> {
    key: K,
    position: u64,
    size: u32,
    hit_count: AtomicU64,
    expiry_secs: AtomicU32,
    /// Transient reference to an in-flight soft-locked element, so the lock
    /// holder's own read observes its uncommitted write without a disk
    /// round-trip. Never persisted.
    in_flight_override: Mutex<Option<Arc<Element<K, V>>>>,
}

impl<K, V> DiskMarker<K, V> {
    /// Create a marker for `element` as written at `position`.
    pub(crate) fn new(key: K, position: u64, size: u32, element: &Arc<Element<K, V>>) -> Self {
        let in_flight = if element.is_soft_locked() {
            Some(Arc::clone(element))
        } else {
            None
        };
        Self {
            key,
            position,
            size,
            hit_count: AtomicU64::new(element.hit_count()),
            expiry_secs: AtomicU32::new(element.expiration_time()),
            in_flight_override: Mutex::new(in_flight),
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub(crate) fn expiration_time(&self) -> u32 {
        self.expiry_secs.load(Ordering::Relaxed)
    }

    /// Record a hit through this marker, refreshing the cached expiry from
    /// the freshly deserialized element.
    pub(crate) fn hit(&self, element: &Element<K, V>) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        element.record_hit();
        self.expiry_secs
            .store(element.expiration_time(), Ordering::Relaxed);
    }

    /// The soft-locked in-flight element, if any.
    pub(crate) fn in_flight_override(&self) -> Option<Arc<Element<K, V>>> {
        self.in_flight_override.lock().clone()
    }
}

/// A store map entry: the element itself, or its substitute.
pub(crate) enum Entry<K, V> {
    /// Element resident in the memory tier, with the pool charge it holds.
    Resident {
        element: Arc<Element<K, V>>,
        charged: u64,
    },
    /// Element in-flight to disk.
    Placeholder(Arc<Placeholder<K, V>>),
    /// Element resident on disk.
    Marker(Arc<DiskMarker<K, V>>),
}

impl<K, V> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        match self {
            Entry::Resident { element, charged } => Entry::Resident {
                element: Arc::clone(element),
                charged: *charged,
            },
            Entry::Placeholder(p) => Entry::Placeholder(Arc::clone(p)),
            Entry::Marker(m) => Entry::Marker(Arc::clone(m)),
        }
    }
}

impl<K, V> Entry<K, V> {
    /// Whether `other` is the same entry by identity (not value equality).
    pub(crate) fn same_entry(&self, other: &Entry<K, V>) -> bool {
        match (self, other) {
            (Entry::Resident { element: a, .. }, Entry::Resident { element: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (Entry::Placeholder(a), Entry::Placeholder(b)) => Arc::ptr_eq(a, b),
            (Entry::Marker(a), Entry::Marker(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether this entry is a substitute (not a resident element).
    pub(crate) fn is_substitute(&self) -> bool {
        !matches!(self, Entry::Resident { .. })
    }

    /// Hit count without touching the disk.
    pub(crate) fn hit_count(&self) -> u64 {
        match self {
            Entry::Resident { element, .. } => element.hit_count(),
            Entry::Placeholder(p) => p.element().hit_count(),
            Entry::Marker(m) => m.hit_count(),
        }
    }

    /// Expiration time without touching the disk.
    pub(crate) fn expiration_time(&self) -> u32 {
        match self {
            Entry::Resident { element, .. } => element.expiration_time(),
            Entry::Placeholder(p) => p.element().expiration_time(),
            Entry::Marker(m) => m.expiration_time(),
        }
    }
}
