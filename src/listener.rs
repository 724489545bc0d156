//! Store event notifications.

use crate::element::Element;

/// Receiver for store mutation events.
///
/// Callbacks fire strictly after the mutation they describe has been
/// applied. A replace notifies removal of the old value before put of the
/// new value. Implementations must be cheap and non-blocking; they run on
/// the mutating thread (or the disk writer thread for disk-side evictions
/// and expiry).
pub trait StoreListener<K, V>: Send + Sync {
    /// An element was stored (insert or overwrite).
    fn element_put(&self, _element: &Element<K, V>) {}

    /// An element was explicitly removed.
    fn element_removed(&self, _element: &Element<K, V>) {}

    /// An element was evicted to satisfy a capacity or pool constraint.
    fn element_evicted(&self, _element: &Element<K, V>) {}

    /// An element was removed because it expired.
    fn element_expired(&self, _element: &Element<K, V>) {}
}

/// Listener that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl<K, V> StoreListener<K, V> for NullListener {}
