//! Compound store behavior across tiers.
//!
//! These tests drive the public store API through tier transitions:
//! overflow to disk, faulting back into memory, expiry, and notification
//! ordering.

use parking_lot::Mutex;
use spillcache::{
    CompoundStore, Element, StoreConfig, StoreError, StoreListener, Tier,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir, name: &str) -> StoreConfig {
    StoreConfig::new()
        .data_path(dir.path().join(name))
        .expiry_interval(Duration::from_secs(600))
}

fn store(dir: &TempDir, name: &str) -> CompoundStore<String, String> {
    CompoundStore::new(config(dir, name)).expect("failed to build store")
}

fn element(key: &str, value: &str) -> Element<String, String> {
    Element::new(key.to_string(), value.to_string())
}

#[test]
fn test_put_get_remove_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "basic.data");

    assert!(store.put(element("a", "1")).unwrap());
    assert!(store.put(element("b", "2")).unwrap());
    assert_eq!(store.len(), 2);
    assert!(store.contains_key(&"a".to_string()));

    let hit = store.get(&"a".to_string()).unwrap().unwrap();
    assert_eq!(hit.value(), "1");

    let removed = store.remove(&"a".to_string()).unwrap().unwrap();
    assert_eq!(removed.value(), "1");
    assert_eq!(store.len(), 1);
    assert!(store.get(&"a".to_string()).unwrap().is_none());
}

#[test]
fn test_put_overwrites_and_reports_absence() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "overwrite.data");

    assert!(store.put(element("a", "1")).unwrap());
    assert!(!store.put(element("a", "2")).unwrap());
    assert_eq!(store.get(&"a".to_string()).unwrap().unwrap().value(), "2");
    assert_eq!(store.len(), 1);
}

#[test]
fn test_put_if_absent() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "pia.data");

    assert!(store.put_if_absent(element("a", "1")).unwrap().is_none());
    let existing = store.put_if_absent(element("a", "2")).unwrap().unwrap();
    assert_eq!(existing.value(), "1");
    assert_eq!(store.get(&"a".to_string()).unwrap().unwrap().value(), "1");
}

#[test]
fn test_remove_element_compares_values() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "re.data");

    store.put(element("a", "1")).unwrap();
    assert!(store
        .remove_element(&"a".to_string(), &"other".to_string())
        .unwrap()
        .is_none());
    assert!(store.contains_key(&"a".to_string()));
    assert!(store
        .remove_element(&"a".to_string(), &"1".to_string())
        .unwrap()
        .is_some());
    assert!(!store.contains_key(&"a".to_string()));
}

#[test]
fn test_replace_requires_existing_mapping() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "replace.data");

    assert!(store.replace(element("a", "1")).unwrap().is_none());
    assert!(!store.contains_key(&"a".to_string()));

    store.put(element("a", "1")).unwrap();
    let old = store.replace(element("a", "2")).unwrap().unwrap();
    assert_eq!(old.value(), "1");
    assert_eq!(store.get(&"a".to_string()).unwrap().unwrap().value(), "2");
}

#[test]
fn test_replace_element_compares_values() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "re2.data");

    store.put(element("a", "1")).unwrap();
    assert!(!store
        .replace_element(&"other".to_string(), element("a", "2"))
        .unwrap());
    assert!(store
        .replace_element(&"1".to_string(), element("a", "2"))
        .unwrap());
    assert_eq!(store.get(&"a".to_string()).unwrap().unwrap().value(), "2");
}

#[test]
fn test_overflow_to_disk_and_fault_back() {
    let dir = TempDir::new().unwrap();
    let store: CompoundStore<String, String> = CompoundStore::new(
        config(&dir, "overflow.data").memory_capacity(1),
    )
    .unwrap();

    store.put(element("cold", "on disk soon")).unwrap();
    store.put(element("hot", "stays put")).unwrap();
    store.flush();

    // the first key was substituted and written out
    assert_eq!(store.tier_of(&"cold".to_string()), Some(Tier::Disk));
    assert_eq!(store.tier_of(&"hot".to_string()), Some(Tier::Memory));
    assert_eq!(store.len(), 2);
    assert_eq!(store.disk_len(), 1);
    assert!(store.on_disk_bytes() > 0);

    // disk round-trip yields the original value and faults it back in
    let faulted = store.get(&"cold".to_string()).unwrap().unwrap();
    assert_eq!(faulted.value(), "on disk soon");
    assert_eq!(store.tier_of(&"cold".to_string()), Some(Tier::Memory));
    assert_eq!(store.len(), 2);
}

#[test]
fn test_placeholder_read_observes_own_write() {
    let dir = TempDir::new().unwrap();
    let store: CompoundStore<String, String> = CompoundStore::new(
        config(&dir, "spool.data").memory_capacity(1),
    )
    .unwrap();

    // no flush: the overflowed key may still be a placeholder, and its
    // in-memory copy must serve reads in the meantime
    store.put(element("first", "v1")).unwrap();
    store.put(element("second", "v2")).unwrap();
    assert_eq!(store.get(&"first".to_string()).unwrap().unwrap().value(), "v1");
    assert_eq!(store.get(&"second".to_string()).unwrap().unwrap().value(), "v2");
}

#[test]
fn test_removing_disk_resident_key_releases_file_space() {
    let dir = TempDir::new().unwrap();
    let store: CompoundStore<String, String> = CompoundStore::new(
        config(&dir, "release.data").memory_capacity(1),
    )
    .unwrap();

    store.put(element("cold", "payload")).unwrap();
    store.put(element("hot", "payload")).unwrap();
    store.flush();
    assert!(store.on_disk_bytes() > 0);

    let removed = store.remove(&"cold".to_string()).unwrap().unwrap();
    assert_eq!(removed.value(), "payload");
    assert_eq!(store.on_disk_bytes(), 0);
    assert_eq!(store.disk_len(), 0);
}

#[test]
fn test_soft_locked_element_served_from_override() {
    let dir = TempDir::new().unwrap();
    let store: CompoundStore<String, String> = CompoundStore::new(
        config(&dir, "softlock.data").memory_capacity(1),
    )
    .unwrap();

    store
        .put(Element::new("locked".to_string(), "uncommitted".to_string()).with_soft_lock(true))
        .unwrap();
    store.put(element("other", "x")).unwrap();
    store.flush();
    assert_eq!(store.tier_of(&"locked".to_string()), Some(Tier::Disk));

    // the disk record drops the transient flag; seeing it set proves the
    // read came from the marker's in-flight override, not the file
    let read = store.get_quiet(&"locked".to_string()).unwrap().unwrap();
    assert!(read.is_soft_locked());
    assert_eq!(read.value(), "uncommitted");
}

/// Listener recording event names in arrival order.
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl StoreListener<String, String> for RecordingListener {
    fn element_put(&self, element: &Element<String, String>) {
        self.events.lock().push(format!("put:{}", element.value()));
    }
    fn element_removed(&self, element: &Element<String, String>) {
        self.events.lock().push(format!("removed:{}", element.value()));
    }
    fn element_evicted(&self, element: &Element<String, String>) {
        self.events.lock().push(format!("evicted:{}", element.value()));
    }
    fn element_expired(&self, element: &Element<String, String>) {
        self.events.lock().push(format!("expired:{}", element.value()));
    }
}

#[test]
fn test_replace_notifies_removal_before_put() {
    let dir = TempDir::new().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let store: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "events.data"))
        .listener(Arc::clone(&listener) as Arc<dyn StoreListener<String, String>>)
        .build()
        .unwrap();

    store.put(element("a", "1")).unwrap();
    store.replace(element("a", "2")).unwrap();
    store.remove(&"a".to_string()).unwrap();

    let events = listener.events.lock();
    assert_eq!(
        *events,
        vec![
            "put:1".to_string(),
            "removed:1".to_string(),
            "put:2".to_string(),
            "removed:2".to_string(),
        ]
    );
}

#[test]
fn test_memory_expiry_on_read() {
    let dir = TempDir::new().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let store: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "expiry.data"))
        .listener(Arc::clone(&listener) as Arc<dyn StoreListener<String, String>>)
        .build()
        .unwrap();

    store
        .put(Element::new("a".to_string(), "1".to_string()).with_ttl(1))
        .unwrap();
    std::thread::sleep(Duration::from_secs(2));

    assert!(store.get(&"a".to_string()).unwrap().is_none());
    assert!(!store.contains_key(&"a".to_string()));
    assert!(listener
        .events
        .lock()
        .contains(&"expired:1".to_string()));
}

#[test]
fn test_config_default_ttl_applies_to_untimed_elements() {
    let dir = TempDir::new().unwrap();
    let store: CompoundStore<String, String> =
        CompoundStore::new(config(&dir, "default_ttl.data").ttl_secs(1)).unwrap();

    store.put(element("short", "1")).unwrap();
    store
        .put(Element::new("long".to_string(), "2".to_string()).with_ttl(600))
        .unwrap();

    std::thread::sleep(Duration::from_secs(2));
    assert!(store.get(&"short".to_string()).unwrap().is_none());
    assert!(store.get(&"long".to_string()).unwrap().is_some());
}

#[test]
fn test_disk_expiry_sweep() {
    let dir = TempDir::new().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let store: CompoundStore<String, String> = CompoundStore::builder()
        .config(config(&dir, "sweep.data").memory_capacity(1))
        .listener(Arc::clone(&listener) as Arc<dyn StoreListener<String, String>>)
        .build()
        .unwrap();

    store
        .put(Element::new("cold".to_string(), "1".to_string()).with_ttl(1))
        .unwrap();
    store
        .put(Element::new("hot".to_string(), "2".to_string()).with_ttl(600))
        .unwrap();
    store.flush();
    assert_eq!(store.tier_of(&"cold".to_string()), Some(Tier::Disk));

    std::thread::sleep(Duration::from_secs(2));
    store.expire_elements();

    assert!(!store.contains_key(&"cold".to_string()));
    assert!(store.contains_key(&"hot".to_string()));
    assert!(listener
        .events
        .lock()
        .contains(&"expired:1".to_string()));
}

#[test]
fn test_dispose_deletes_data_file_and_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dispose.data");
    let store: CompoundStore<String, String> =
        CompoundStore::new(StoreConfig::new().data_path(path.clone())).unwrap();

    store.put(element("a", "1")).unwrap();
    assert!(path.exists());

    store.dispose();
    assert!(!path.exists());
    assert!(matches!(
        store.put(element("b", "2")),
        Err(StoreError::Disposed)
    ));
    assert!(matches!(
        store.get(&"a".to_string()),
        Err(StoreError::Disposed)
    ));
}

#[test]
fn test_clear_empties_all_tiers() {
    let dir = TempDir::new().unwrap();
    let store: CompoundStore<String, String> = CompoundStore::new(
        config(&dir, "clear.data").memory_capacity(1),
    )
    .unwrap();

    for i in 0..10 {
        store.put(element(&format!("k{i}"), &format!("v{i}"))).unwrap();
    }
    store.flush();
    assert_eq!(store.len(), 10);

    store.clear();
    assert!(store.is_empty());
    assert_eq!(store.memory_len(), 0);
    assert_eq!(store.disk_len(), 0);
}

#[test]
fn test_get_quiet_skips_statistics() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir, "quiet.data");

    store.put(element("a", "1")).unwrap();
    assert!(store.get_quiet(&"a".to_string()).unwrap().is_some());
    assert!(store.get_quiet(&"missing".to_string()).unwrap().is_none());
    assert_eq!(store.hit_count(), 0);
    assert_eq!(store.miss_count(), 0);

    store.get(&"a".to_string()).unwrap();
    store.get(&"missing".to_string()).unwrap();
    assert_eq!(store.hit_count(), 1);
    assert_eq!(store.miss_count(), 1);
}
