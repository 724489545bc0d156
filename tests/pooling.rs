//! Shared pool accounting through the store.
//!
//! Exercises the accessor protocol end to end: charges tracking the
//! configured sizer, rejection leaving keys absent with exactly one
//! eviction notification, and shrinking a shared budget across stores.

use spillcache::{
    CompoundStore, CountSizer, Element, ElementSizer, Pool, StoreConfig, StoreListener,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Sizer whose charge and failure mode can be changed mid-test.
#[derive(Default)]
struct TestSizer {
    size: AtomicU64,
    fail: AtomicBool,
}

impl TestSizer {
    fn new(size: u64) -> Self {
        Self {
            size: AtomicU64::new(size),
            fail: AtomicBool::new(false),
        }
    }
}

impl ElementSizer<String, String> for TestSizer {
    fn size_of(&self, _key: &String, _value: &String) -> Option<u64> {
        if self.fail.load(Ordering::Acquire) {
            None
        } else {
            Some(self.size.load(Ordering::Acquire))
        }
    }
}

#[derive(Default)]
struct EvictionCounter {
    evictions: AtomicUsize,
}

impl StoreListener<String, String> for EvictionCounter {
    fn element_evicted(&self, _element: &Element<String, String>) {
        self.evictions.fetch_add(1, Ordering::AcqRel);
    }
}

fn config(dir: &TempDir, name: &str) -> StoreConfig {
    StoreConfig::new()
        .data_path(dir.path().join(name))
        .expiry_interval(Duration::from_secs(600))
}

#[test]
fn test_accessor_charge_reconfigure_and_failure() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(100);
    let sizer = Arc::new(TestSizer::new(1));
    let listener = Arc::new(EvictionCounter::default());
    let store: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "accessor.data"))
        .on_heap_pool(&pool, Arc::clone(&sizer) as Arc<dyn ElementSizer<String, String>>)
        .listener(Arc::clone(&listener) as Arc<dyn StoreListener<String, String>>)
        .build()
        .unwrap();

    // accessor charges size=1 per add
    store
        .put(Element::new("key".to_string(), "value".to_string()))
        .unwrap();
    assert_eq!(pool.size(), 1);

    // reconfigure the sizer, cycle the key, and the charge follows
    sizer.size.store(3, Ordering::Release);
    store.remove(&"key".to_string()).unwrap();
    assert_eq!(pool.size(), 0);
    store
        .put(Element::new("key".to_string(), "value".to_string()))
        .unwrap();
    assert_eq!(pool.size(), 3);

    // a failing sizer rejects the add: the key stays absent and the
    // eviction callback fires exactly once
    sizer.fail.store(true, Ordering::Release);
    store
        .put(Element::new("key2".to_string(), "value2".to_string()))
        .unwrap();
    assert!(store.get(&"key2".to_string()).unwrap().is_none());
    assert_eq!(listener.evictions.load(Ordering::Acquire), 1);
    assert_eq!(pool.size(), 3);

    // the original mapping is untouched
    sizer.fail.store(false, Ordering::Release);
    assert_eq!(store.get(&"key".to_string()).unwrap().unwrap().value(), "value");
}

#[test]
fn test_pool_round_trip_through_store() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(1000);
    let store: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "roundtrip.data"))
        .on_heap_pool(&pool, Arc::new(CountSizer))
        .build()
        .unwrap();

    for i in 0..50 {
        store
            .put(Element::new(format!("k{i}"), format!("v{i}")))
            .unwrap();
    }
    assert_eq!(pool.size(), 50);

    // overwrites swap the charge, not leak it
    for i in 0..50 {
        store
            .put(Element::new(format!("k{i}"), format!("w{i}")))
            .unwrap();
    }
    assert_eq!(pool.size(), 50);

    for i in 0..50 {
        store.remove(&format!("k{i}")).unwrap();
    }
    assert_eq!(pool.size(), 0);
}

#[test]
fn test_shrinking_pool_overflows_residents_to_disk() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(100);
    let store_a: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "shrink_a.data"))
        .on_heap_pool(&pool, Arc::new(CountSizer))
        .build()
        .unwrap();
    let store_b: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "shrink_b.data"))
        .on_heap_pool(&pool, Arc::new(CountSizer))
        .build()
        .unwrap();

    for i in 0..10 {
        store_a
            .put(Element::new(format!("a{i}"), "x".repeat(32)))
            .unwrap();
        store_b
            .put(Element::new(format!("b{i}"), "x".repeat(32)))
            .unwrap();
    }
    assert_eq!(pool.size(), 20);

    // shrinking the budget runs the evictor synchronously; evicted
    // residents overflow to disk and release their heap charges
    pool.set_max_size(10);
    assert!(pool.size() <= 10);

    // no key was lost, only displaced to the disk tier
    store_a.flush();
    store_b.flush();
    assert_eq!(store_a.len(), 10);
    assert_eq!(store_b.len(), 10);
    for i in 0..10 {
        assert!(store_a.get(&format!("a{i}")).unwrap().is_some());
        assert!(store_b.get(&format!("b{i}")).unwrap().is_some());
    }
}

#[test]
fn test_charge_over_budget_triggers_cross_store_eviction() {
    let dir = TempDir::new().unwrap();
    let pool = Pool::new(10);
    let store: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "overbudget.data"))
        .on_heap_pool(&pool, Arc::new(CountSizer))
        .build()
        .unwrap();

    // every put beyond the budget makes room by overflowing an older
    // resident to disk rather than rejecting the add
    for i in 0..25 {
        store
            .put(Element::new(format!("k{i}"), format!("v{i}")))
            .unwrap();
    }
    assert!(pool.size() <= 10);
    assert_eq!(store.len(), 25);

    store.flush();
    for i in 0..25 {
        assert!(store.get(&format!("k{i}")).unwrap().is_some(), "k{i} lost");
    }
}
