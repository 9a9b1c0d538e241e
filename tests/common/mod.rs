//! Shared fakes for the integration tests: an in-memory disk factory that
//! tracks create/free pairing, a notifier that records every event, and a
//! harness that wires a segment to bounded pools.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tiered_store::{
    BoundedPool, CacheEventNotifier, DiskStorageFactory, Element, PoolTier, Segment,
    SegmentConfig, Substitute, SubstituteRef,
};

/// Disk factory backed by a hash map. Every substitute handed out is
/// tracked so tests can assert the one-free-per-create contract.
pub struct FakeDiskFactory {
    created: AtomicUsize,
    freed: AtomicUsize,
    double_frees: AtomicUsize,
    fault_failure_frees: AtomicUsize,
    freed_ptrs: Mutex<HashSet<usize>>,
    // Every substitute ever created is pinned here so addresses are never
    // reused and pointer-based free tracking stays exact.
    all_created: Mutex<Vec<SubstituteRef>>,
    store: Mutex<HashMap<u64, Element>>,
    next_location: AtomicU64,
}

impl FakeDiskFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            double_frees: AtomicUsize::new(0),
            fault_failure_frees: AtomicUsize::new(0),
            freed_ptrs: Mutex::new(HashSet::new()),
            all_created: Mutex::new(Vec::new()),
            store: Mutex::new(HashMap::new()),
            next_location: AtomicU64::new(0),
        })
    }

    /// Write an element to the fake disk and hand back its marker, tracked
    /// like a factory-created substitute.
    pub fn persist(&self, element: Element) -> SubstituteRef {
        let location = self.next_location.fetch_add(1, Ordering::Relaxed);
        let size = (element.key().len() + element.value().len()) as u64;
        let expire_at = element.expire_at();
        self.store.lock().insert(location, element);
        self.created.fetch_add(1, Ordering::Relaxed);
        let marker = Substitute::disk_marker(location, size, expire_at);
        self.all_created.lock().push(marker.clone());
        marker
    }

    pub fn create_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    pub fn double_free_count(&self) -> usize {
        self.double_frees.load(Ordering::Relaxed)
    }

    pub fn fault_failure_free_count(&self) -> usize {
        self.fault_failure_frees.load(Ordering::Relaxed)
    }
}

impl DiskStorageFactory for FakeDiskFactory {
    fn create(&self, element: Element) -> SubstituteRef {
        self.created.fetch_add(1, Ordering::Relaxed);
        let substitute = Substitute::decoded(element);
        self.all_created.lock().push(substitute.clone());
        substitute
    }

    fn retrieve(&self, substitute: &SubstituteRef, _hit: bool) -> Option<Element> {
        if let Some(element) = substitute.in_heap_element() {
            return Some(element.clone());
        }
        let location = substitute.location()?;
        self.store.lock().get(&location).cloned()
    }

    fn free(&self, substitute: &SubstituteRef, fault_failure: bool) {
        let ptr = Arc::as_ptr(substitute) as usize;
        if !self.freed_ptrs.lock().insert(ptr) {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.freed.fetch_add(1, Ordering::Relaxed);
        if fault_failure {
            self.fault_failure_frees.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(location) = substitute.location() {
            self.store.lock().remove(&location);
        }
    }
}

/// Events a segment can emit, keyed by element value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Put(Vec<u8>),
    Updated(Vec<u8>, Vec<u8>),
    Removed(Vec<u8>),
    Evicted(Vec<u8>),
    Expired(Vec<u8>),
}

/// Notifier that records every event it sees.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count_updated(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Updated(_, _)))
            .count()
    }
}

impl CacheEventNotifier for RecordingNotifier {
    fn element_put(&self, element: &Element) {
        self.events.lock().push(Event::Put(element.value().to_vec()));
    }

    fn element_updated(&self, old: &Element, new: &Element) {
        self.events
            .lock()
            .push(Event::Updated(old.value().to_vec(), new.value().to_vec()));
    }

    fn element_removed(&self, element: &Element) {
        self.events
            .lock()
            .push(Event::Removed(element.value().to_vec()));
    }

    fn element_evicted(&self, element: &Element) {
        self.events
            .lock()
            .push(Event::Evicted(element.value().to_vec()));
    }

    fn element_expired(&self, element: &Element) {
        self.events
            .lock()
            .push(Event::Expired(element.value().to_vec()));
    }
}

/// A segment wired to a fake disk, bounded pools and a recording notifier.
pub struct Harness {
    pub segment: Arc<Segment>,
    pub disk: Arc<FakeDiskFactory>,
    pub heap_pool: Arc<BoundedPool>,
    pub disk_pool: Arc<BoundedPool>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(heap_capacity: i64, disk_capacity: i64) -> Self {
        Self::with_config(
            SegmentConfig::new().with_initial_capacity(4),
            heap_capacity,
            disk_capacity,
        )
    }

    pub fn with_config(config: SegmentConfig, heap_capacity: i64, disk_capacity: i64) -> Self {
        let disk = FakeDiskFactory::new();
        let heap_pool = Arc::new(BoundedPool::new(PoolTier::Heap, heap_capacity));
        let disk_pool = Arc::new(BoundedPool::new(PoolTier::Disk, disk_capacity));
        let notifier = RecordingNotifier::new();
        let segment = Arc::new(
            Segment::new(
                config,
                disk.clone(),
                heap_pool.clone(),
                disk_pool.clone(),
                notifier.clone(),
            )
            .unwrap(),
        );
        Self {
            segment,
            disk,
            heap_pool,
            disk_pool,
            notifier,
        }
    }

    /// Sum of recorded heap sizes across live entries.
    pub fn live_heap_bytes(&self) -> i64 {
        self.segment
            .iter()
            .map(|e| e.substitute().on_heap_size())
            .sum()
    }

    /// Sum of disk marker sizes across live entries.
    pub fn live_disk_bytes(&self) -> i64 {
        self.segment
            .iter()
            .filter_map(|e| e.substitute().disk_size())
            .map(|s| s as i64)
            .sum()
    }
}
