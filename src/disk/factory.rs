//! Disk overflow factory.
//!
//! The factory owns one data file and moves elements between it and the
//! store map:
//!
//! - `create` serializes an element eagerly and returns a placeholder; the
//!   serialized bytes travel with the placeholder so a non-serializable
//!   payload is rejected before any counter or map mutation.
//! - The placeholder is scheduled onto a single writer thread which
//!   allocates a file region, writes the record, and installs a marker in
//!   the placeholder's place via a compare-and-swap fault. A single writer
//!   thread serializes all region writes, so concurrent writers to one
//!   file region never occur.
//! - `read_marker` reads `size` bytes at `position` and deserializes.
//!   I/O and decode failures are fatal; they indicate data-file corruption
//!   and are never treated as a miss.
//!
//! The writer thread doubles as the expiry sweeper: between write tasks it
//! wakes at the configured interval and evicts expired markers. It also
//! completes marker region frees that could not take the key's write lock
//! at free time, so a region is never recycled while a reader may still
//! hold its marker.
//!
//! Capacity is an element count; exceeding it triggers a bounded eviction
//! pass (at most [`MAX_EVICT`] victims per trigger, lowest hit count among
//! up to [`SAMPLE_SIZE`] sampled entries). Both `create` and write-task
//! completion are trigger points.

use crate::config::StoreConfig;
use crate::disk::region::FreeRegions;
use crate::disk::substitute::{DiskMarker, Entry, Placeholder};
use crate::element::{now_secs, CacheKey, CacheValue, Element, ETERNAL};
use crate::error::{StoreError, StoreResult};
use crate::store::compound::StoreInner;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on evictions per capacity trigger.
pub(crate) const MAX_EVICT: usize = 5;

/// Upper bound on entries sampled per eviction decision.
pub(crate) const SAMPLE_SIZE: usize = 30;

enum Command<K, V> {
    Write {
        key: K,
        placeholder: Arc<Placeholder<K, V>>,
    },
    FreeRegion(Arc<DiskMarker<K, V>>),
    Flush(Sender<()>),
    Shutdown,
}

/// Factory for the disk overflow tier of one store.
pub(crate) struct DiskFactory<K, V> {
    file: File,
    path: PathBuf,
    allocator: Mutex<FreeRegions>,
    /// Live substitutes (placeholders and markers) created by this factory.
    count: AtomicUsize,
    /// Maximum elements on disk; `0` means unbounded.
    capacity: AtomicUsize,
    /// Serialized bytes queued for the writer thread.
    queued_bytes: AtomicU64,
    spool_capacity: u64,
    expiry_interval: Duration,
    tx: Sender<Command<K, V>>,
    rx: Mutex<Option<Receiver<Command<K, V>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> DiskFactory<K, V> {
    /// Create a factory over the configured data file.
    ///
    /// The file always starts empty: records from a previous process have
    /// no surviving index and cannot be recovered.
    pub(crate) fn new(config: &StoreConfig) -> StoreResult<Self> {
        let path = config.data_path.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        log::debug!("created data file {}", path.display());

        let (tx, rx) = unbounded();
        Ok(Self {
            file,
            path,
            allocator: Mutex::new(FreeRegions::new()),
            count: AtomicUsize::new(0),
            capacity: AtomicUsize::new(config.disk_capacity),
            queued_bytes: AtomicU64::new(0),
            spool_capacity: config.spool_buffer_bytes,
            expiry_interval: config.expiry_interval,
            tx,
            rx: Mutex::new(Some(rx)),
            writer: Mutex::new(None),
        })
    }

    /// Schedule the asynchronous disk write for an installed placeholder.
    pub(crate) fn installed(&self, key: K, placeholder: Arc<Placeholder<K, V>>) {
        let len = placeholder.serialized().len() as u64;
        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(Command::Write { key, placeholder }).is_err() {
            // writer already shut down; the entry stays a placeholder and
            // is still readable through its held element
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            log::warn!("disk writer is down; spooled write dropped");
        }
    }

    /// Whether the spool buffer is over its configured bound.
    pub(crate) fn buffer_full(&self) -> bool {
        self.queued_bytes.load(Ordering::Acquire) > self.spool_capacity
    }

    /// Release accounting for a placeholder removed from the map.
    pub(crate) fn free_placeholder(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Release accounting for a marker removed from the map. The file
    /// region is released separately through [`free_region`](Self::free_region).
    pub(crate) fn release_marker(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Return a marker's file region to the allocator.
    ///
    /// Only safe once no reader can hold the marker: under the key's write
    /// lock, or for a marker that was never published.
    pub(crate) fn free_region(&self, marker: &DiskMarker<K, V>) {
        self.allocator
            .lock()
            .free(marker.position(), marker.size() as u64);
    }

    /// Hand a region free to the writer thread, which takes the key's
    /// write lock before recycling the region.
    pub(crate) fn schedule_region_free(&self, marker: Arc<DiskMarker<K, V>>) {
        // a send failure means shutdown is underway and the file is being
        // deleted wholesale
        let _ = self.tx.send(Command::FreeRegion(marker));
    }

    /// Number of live substitutes created by this factory.
    pub(crate) fn size(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Bytes of the data file covered by live records.
    pub(crate) fn occupied_len(&self) -> u64 {
        self.allocator.lock().occupied_len()
    }

    /// Change the on-disk capacity (`0` = unbounded).
    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Shrink the data file down to its occupied length.
    pub(crate) fn shrink_data_file(&self) {
        let len = self.allocator.lock().shrink();
        if let Err(e) = self.file.set_len(len) {
            log::error!("failed to shrink data file: {e}");
        }
    }

    /// Block until every write spooled before this call has completed.
    pub(crate) fn flush(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Stop the writer thread and delete the data file.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("failed to delete data file {}: {e}", self.path.display());
        } else {
            log::debug!("deleted data file {}", self.path.display());
        }
        self.allocator.lock().clear();
    }
}

impl<K: CacheKey, V: CacheValue> DiskFactory<K, V> {
    /// Bind the factory to its store and start the writer thread.
    pub(crate) fn bind(&self, store: &Arc<StoreInner<K, V>>) {
        let rx = self
            .rx
            .lock()
            .take()
            .expect("disk factory bound more than once");
        let weak = Arc::downgrade(store);
        let interval = self.expiry_interval;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "spillcache".to_string());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || writer_loop(weak, rx, interval))
            .expect("failed to spawn disk writer thread");
        *self.writer.lock() = Some(handle);
    }

    /// Create a placeholder for `element`.
    ///
    /// Only serializable elements are accepted; a serialization failure is
    /// a permanent rejection with no side effect. Creation counts against
    /// the disk capacity and triggers a bounded eviction pass when over.
    pub(crate) fn create(
        &self,
        store: &StoreInner<K, V>,
        key: &K,
        element: &Arc<Element<K, V>>,
    ) -> StoreResult<Entry<K, V>> {
        let serialized =
            bincode::serialize(element.as_ref()).map_err(StoreError::NotSerializable)?;
        let size = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        let capacity = self.capacity.load(Ordering::Acquire);
        if capacity > 0 && size > capacity {
            self.evict_over_capacity(store, size - capacity, Some(key), size);
        }
        Ok(Entry::Placeholder(Arc::new(Placeholder::new(
            Arc::clone(element),
            serialized,
        ))))
    }

    /// Read the element a marker points at.
    ///
    /// A soft-locked in-flight override short-circuits the disk read.
    pub(crate) fn read_marker(&self, marker: &DiskMarker<K, V>) -> StoreResult<Arc<Element<K, V>>> {
        if let Some(element) = marker.in_flight_override() {
            return Ok(element);
        }
        let mut buf = vec![0u8; marker.size() as usize];
        self.file.read_exact_at(&mut buf, marker.position())?;
        let element: Element<K, V> = bincode::deserialize(&buf).map_err(StoreError::Corrupt)?;
        Ok(Arc::new(element))
    }

    /// Serialize and write one placeholder, then swap in its marker.
    ///
    /// Runs on the writer thread. A write failure marks the placeholder
    /// failed-to-flush and evicts the key: the element can no longer reach
    /// disk and must not linger as a permanent placeholder.
    fn run_write(&self, store: &StoreInner<K, V>, key: K, placeholder: Arc<Placeholder<K, V>>) {
        let len = placeholder.serialized().len() as u64;

        if placeholder.has_failed_to_flush() || !store.contains_key(&key) {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            return;
        }

        let position = self.allocator.lock().allocate(len);
        if let Err(e) = self.file.write_all_at(placeholder.serialized(), position) {
            log::error!("disk write failed: {e}");
            placeholder.set_failed_to_flush();
            self.allocator.lock().free(position, len);
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            store.evict_entry(&key, Some(&Entry::Placeholder(Arc::clone(&placeholder))));
            return;
        }

        let marker = Arc::new(DiskMarker::new(
            key.clone(),
            position,
            len as u32,
            placeholder.element(),
        ));
        self.count.fetch_add(1, Ordering::AcqRel);
        store.charge_disk(len);

        let expect = Entry::Placeholder(Arc::clone(&placeholder));
        let installed = store.fault(&key, &expect, Entry::Marker(marker));
        self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
        if installed {
            let size = self.count.load(Ordering::Acquire);
            let capacity = self.capacity.load(Ordering::Acquire);
            if capacity > 0 && size > capacity {
                self.evict_over_capacity(store, size - capacity, Some(&key), size);
            }
        }
        // on a failed fault the marker was freed by the fault path: the
        // key was removed or replaced while the write was in flight
    }

    /// Evict up to `min(MAX_EVICT, overflow)` disk entries.
    fn evict_over_capacity(
        &self,
        store: &StoreInner<K, V>,
        overflow: usize,
        key_hint: Option<&K>,
        size: usize,
    ) {
        let capacity = self.capacity.load(Ordering::Acquire);
        for _ in 0..overflow.min(MAX_EVICT) {
            match store.eviction_target(SAMPLE_SIZE.min(size), key_hint, Entry::is_substitute) {
                Some((victim, entry)) => {
                    if store.evict_entry(&victim, Some(&entry))
                        && self.count.load(Ordering::Acquire) <= capacity
                    {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    /// Remove expired markers, notifying expiry for each.
    pub(crate) fn expiry_sweep(&self, store: &StoreInner<K, V>) {
        let now = now_secs();
        for (key, entry) in store.substitute_snapshot() {
            if let Entry::Marker(_) = &entry {
                let expiry = entry.expiration_time();
                if expiry != ETERNAL && expiry <= now {
                    store.expire_entry(&key, &entry, None);
                }
            }
        }
    }
}

fn writer_loop<K: CacheKey, V: CacheValue>(
    store: Weak<StoreInner<K, V>>,
    rx: Receiver<Command<K, V>>,
    interval: Duration,
) {
    let mut next_sweep = Instant::now() + interval;
    loop {
        let wait = next_sweep.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(Command::Write { key, placeholder }) => match store.upgrade() {
                Some(store) => store.disk().run_write(&store, key, placeholder),
                None => break,
            },
            Ok(Command::FreeRegion(marker)) => match store.upgrade() {
                Some(store) => store.complete_region_free(&marker),
                None => break,
            },
            Ok(Command::Flush(done)) => {
                let _ = done.send(());
            }
            Ok(Command::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                match store.upgrade() {
                    Some(store) => store.disk().expiry_sweep(&store),
                    None => break,
                }
                next_sweep = Instant::now() + interval;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
