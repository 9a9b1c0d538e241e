//! One independently-lockable shard of the tiered store.
//!
//! A [`Segment`] owns a power-of-two bucket table of [`HashEntry`] chains
//! and a single read-write lock. All the tiering machinery lives here:
//! pool-budgeted admission, the substitution protocol, best-effort
//! eviction, and the fault transaction that moves a value's authoritative
//! representation between the memory and disk tiers.
//!
//! # Locking
//!
//! - Lookups (`get`, `contains_key`, `is_faulted`, sampling) take the read
//!   lock. Decoding happens inside the read lock so results are consistent
//!   with the entry state at the moment of the call.
//! - Mutations take the write lock. Expensive encodes happen *before* the
//!   lock is acquired, so the exclusive section scales with chain length,
//!   not encode cost.
//! - [`Segment::evict`] only ever tries the write lock. Eviction is
//!   best-effort background work; contention makes it a silent no-op.
//! - The per-entry `faulted` flag is the one field mutated outside full
//!   lock discipline: `get` sets it while holding only the read lock, so
//!   it is a genuine atomic.
//!
//! # Chain edits
//!
//! Published chain nodes are never relinked in place. A structural edit
//! rebuilds the prefix ahead of the edit point and reuses the unchanged
//! suffix, so a traversal that started before the edit still sees a
//! consistent (possibly stale) chain.

use crate::config::{SegmentConfig, MAXIMUM_CAPACITY};
use crate::element::{DefaultElementComparator, Element, ElementComparator};
use crate::error::{StoreError, StoreResult};
use crate::notify::CacheEventNotifier;
use crate::pool::PoolAccessor;
use crate::substitute::{DiskStorageFactory, SubstituteRef};
use crate::sync::{AtomicBool, Ordering};
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;

/// One node in a bucket chain.
///
/// Nodes are immutable in `key`, `hash` and `next`; the substitute slot and
/// the faulted flag are interior-mutable. When a prefix node is cloned
/// during a structural edit, the clone shares the *same* faulted flag, so a
/// reader that marks an entry faulted through a stale chain is never lost.
pub struct HashEntry {
    key: Box<[u8]>,
    hash: u64,
    next: Option<Arc<HashEntry>>,
    substitute: RwLock<SubstituteRef>,
    faulted: Arc<AtomicBool>,
}

impl HashEntry {
    fn new(
        key: Box<[u8]>,
        hash: u64,
        next: Option<Arc<HashEntry>>,
        substitute: SubstituteRef,
        faulted: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            hash,
            next,
            substitute: RwLock::new(substitute),
            faulted,
        })
    }

    /// The entry's key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The entry's precomputed spread hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The entry's current substitute.
    pub fn substitute(&self) -> SubstituteRef {
        self.substitute.read().clone()
    }

    fn set_substitute(&self, substitute: SubstituteRef) {
        *self.substitute.write() = substitute;
    }

    /// Whether a higher tier currently holds the authoritative copy.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::SeqCst);
    }

    fn matches(&self, key: &[u8], hash: u64) -> bool {
        self.hash == hash && &*self.key == key
    }
}

/// Everything guarded by the segment lock.
struct SegmentState {
    table: Vec<Option<Arc<HashEntry>>>,
    count: usize,
    mod_count: u64,
    threshold: usize,
}

impl SegmentState {
    fn index(&self, hash: u64) -> usize {
        (hash as usize) & (self.table.len() - 1)
    }

    fn find(&self, key: &[u8], hash: u64) -> Option<Arc<HashEntry>> {
        let mut cursor = self.table[self.index(hash)].as_ref();
        while let Some(entry) = cursor {
            if entry.matches(key, hash) {
                return Some(Arc::clone(entry));
            }
            cursor = entry.next.as_ref();
        }
        None
    }

    /// Collect the bucket chain for `hash` front to back.
    fn chain(&self, hash: u64) -> Vec<Arc<HashEntry>> {
        let mut chain = Vec::new();
        let mut cursor = self.table[self.index(hash)].clone();
        while let Some(entry) = cursor {
            cursor = entry.next.clone();
            chain.push(entry);
        }
        chain
    }

    /// Unlink `chain[pos]` by cloning the prefix onto the unchanged suffix.
    fn unlink(&mut self, hash: u64, chain: &[Arc<HashEntry>], pos: usize) {
        self.mod_count += 1;
        let mut new_first = chain[pos].next.clone();
        for node in chain[..pos].iter().rev() {
            new_first = Some(HashEntry::new(
                node.key.clone(),
                node.hash,
                new_first,
                node.substitute(),
                Arc::clone(&node.faulted),
            ));
        }
        let index = self.index(hash);
        self.table[index] = new_first;
        self.count -= 1;
    }
}

/// A lock-sharded, pool-budgeted, two-tier hash store shard.
pub struct Segment {
    state: RwLock<SegmentState>,
    disk: Arc<dyn DiskStorageFactory>,
    heap_pool: Arc<dyn PoolAccessor>,
    disk_pool: Arc<dyn PoolAccessor>,
    notifier: Arc<dyn CacheEventNotifier>,
    load_factor: f32,
    cache_pinned: bool,
}

impl Segment {
    /// Create a segment.
    ///
    /// The factory owns the disk tier; the two pool accessors track heap
    /// and disk byte budgets respectively.
    pub fn new(
        config: SegmentConfig,
        disk: Arc<dyn DiskStorageFactory>,
        heap_pool: Arc<dyn PoolAccessor>,
        disk_pool: Arc<dyn PoolAccessor>,
        notifier: Arc<dyn CacheEventNotifier>,
    ) -> StoreResult<Self> {
        let config = config.validated()?;
        let capacity = config.initial_capacity;
        Ok(Self {
            state: RwLock::new(SegmentState {
                table: vec![None; capacity],
                count: 0,
                mod_count: 0,
                threshold: (capacity as f32 * config.load_factor) as usize,
            }),
            disk,
            heap_pool,
            disk_pool,
            notifier,
            load_factor: config.load_factor,
            cache_pinned: config.cache_pinned,
        })
    }

    fn decode(&self, substitute: &SubstituteRef) -> Option<Element> {
        self.disk.retrieve(substitute, false)
    }

    fn decode_hit(&self, substitute: &SubstituteRef) -> Option<Element> {
        self.disk.retrieve(substitute, true)
    }

    fn free(&self, substitute: &SubstituteRef, fault_failure: bool) {
        self.disk.free(substitute, fault_failure);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.read().count
    }

    /// Whether the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structural modification count, for diagnostics.
    pub fn mod_count(&self) -> u64 {
        self.state.read().mod_count
    }

    /// Get the element mapped to this key, or `None` if there is no
    /// mapping.
    ///
    /// When `mark_faulted` is set the entry's faulted bit is raised before
    /// decoding, telling the disk tier that a higher tier is about to hold
    /// the authoritative copy.
    pub fn get(&self, key: &[u8], hash: u64, mark_faulted: bool) -> Option<Element> {
        let state = self.state.read();
        if state.count == 0 {
            return None;
        }
        let entry = state.find(key, hash)?;
        if mark_faulted {
            entry.set_faulted(true);
        }
        let substitute = entry.substitute();
        self.decode_hit(&substitute)
    }

    /// Return the undecoded substitute for this key. Never touches disk.
    pub fn unretrieved_get(&self, key: &[u8], hash: u64) -> Option<SubstituteRef> {
        let state = self.state.read();
        if state.count == 0 {
            return None;
        }
        state.find(key, hash).map(|entry| entry.substitute())
    }

    /// Whether this segment contains a mapping for the key.
    pub fn contains_key(&self, key: &[u8], hash: u64) -> bool {
        let state = self.state.read();
        state.count != 0 && state.find(key, hash).is_some()
    }

    /// Whether the mapping for this key is marked faulted. `false` when
    /// there is no mapping.
    pub fn is_faulted(&self, key: &[u8], hash: u64) -> bool {
        let state = self.state.read();
        if state.count == 0 {
            return false;
        }
        state
            .find(key, hash)
            .map(|entry| entry.is_faulted())
            .unwrap_or(false)
    }

    /// Add the supplied mapping.
    ///
    /// The element is encoded and admitted to the heap pool before the
    /// write lock is taken; a rejected admission aborts the whole
    /// operation with nothing installed and nothing leaked. If
    /// `only_if_absent` is set an existing mapping is left untouched and
    /// its decoded element returned.
    ///
    /// Returns the previous element mapped to this key, if any.
    pub fn put(
        &self,
        key: &[u8],
        hash: u64,
        element: Element,
        only_if_absent: bool,
        faulted: bool,
    ) -> Option<Element> {
        let encoded = self.disk.create(element.clone());
        let incoming_heap_size =
            match self
                .heap_pool
                .add(key, Some(&encoded), None, self.cache_pinned || faulted)
            {
                Some(size) => {
                    debug!("put added {size} on heap");
                    size
                }
                None => {
                    debug!("put failed to add on heap");
                    self.free(&encoded, false);
                    return None;
                }
            };
        encoded.set_on_heap_size(incoming_heap_size);

        let mut installed = false;
        let old_element;
        {
            let mut state = self.state.write();
            if state.count + 1 > state.threshold {
                self.rehash(&mut state);
            }

            match state.find(key, hash) {
                Some(entry) => {
                    let on_disk_substitute = entry.substitute();
                    if !only_if_absent {
                        entry.set_substitute(Arc::clone(&encoded));
                        installed = true;
                        old_element = self.decode(&on_disk_substitute);

                        self.free(&on_disk_substitute, false);
                        let existing_heap_size =
                            self.heap_pool.delete(on_disk_substitute.on_heap_size());
                        debug!("put updated, deleted {existing_heap_size} on heap");

                        if let Some(disk_size) = on_disk_substitute.disk_size() {
                            let existing_disk_size = self.disk_pool.delete(disk_size as i64);
                            debug!("put updated, deleted {existing_disk_size} on disk");
                        }
                        entry.set_faulted(faulted);
                        if let Some(old) = &old_element {
                            self.notifier.element_updated(old, &element);
                        }
                    } else {
                        old_element = self.decode(&on_disk_substitute);

                        self.free(&encoded, false);
                        let outgoing_heap_size = self.heap_pool.delete(encoded.on_heap_size());
                        debug!("put if absent failed, deleted {outgoing_heap_size} on heap");
                    }
                }
                None => {
                    old_element = None;
                    state.mod_count += 1;
                    let index = state.index(hash);
                    let first = state.table[index].take();
                    state.table[index] = Some(HashEntry::new(
                        key.into(),
                        hash,
                        first,
                        Arc::clone(&encoded),
                        Arc::new(AtomicBool::new(faulted)),
                    ));
                    installed = true;
                    state.count += 1;
                    self.notifier.element_put(&element);
                }
            }
        }

        if installed {
            self.disk.installed(&encoded);
        }
        old_element
    }

    /// Add a pre-encoded mapping, used for warm restart.
    ///
    /// Returns `Ok(false)` when either pool refuses the reservation,
    /// `Ok(true)` on install. Finding the key already present signals a
    /// corrupt restart source: both reservations are rolled back and
    /// [`StoreError::DuplicateKey`] is returned.
    pub fn put_raw_if_absent(
        &self,
        key: &[u8],
        hash: u64,
        encoded: SubstituteRef,
    ) -> StoreResult<bool> {
        let mut state = self.state.write();
        if !self.disk_pool.can_add_without_evicting(key, None, Some(&encoded)) {
            return Ok(false);
        }
        let incoming_heap_size =
            match self.heap_pool.add(key, Some(&encoded), None, self.cache_pinned) {
                Some(size) => size,
                None => return Ok(false),
            };
        encoded.set_on_heap_size(incoming_heap_size);
        if self
            .disk_pool
            .add(key, None, Some(&encoded), self.cache_pinned)
            .is_none()
        {
            self.heap_pool.delete(encoded.on_heap_size());
            return Ok(false);
        }

        if state.count + 1 > state.threshold {
            self.rehash(&mut state);
        }

        if state.find(key, hash).is_some() {
            self.heap_pool.delete(encoded.on_heap_size());
            if let Some(disk_size) = encoded.disk_size() {
                self.disk_pool.delete(disk_size as i64);
            }
            return Err(StoreError::DuplicateKey);
        }

        state.mod_count += 1;
        let index = state.index(hash);
        let first = state.table[index].take();
        state.table[index] = Some(HashEntry::new(
            key.into(),
            hash,
            first,
            encoded,
            Arc::new(AtomicBool::new(false)),
        ));
        state.count += 1;
        Ok(true)
    }

    /// Replace the entry for this key only if currently mapped to some
    /// element. Returns the previous element on success.
    pub fn replace_if_present(&self, key: &[u8], hash: u64, element: Element) -> Option<Element> {
        let encoded = self.disk.create(element.clone());

        let mut installed = false;
        let old_element;
        {
            let state = self.state.write();
            match state.find(key, hash) {
                Some(entry) => {
                    let on_disk_substitute = entry.substitute();
                    match self.heap_pool.replace(
                        on_disk_substitute.on_heap_size(),
                        key,
                        Some(&encoded),
                        None,
                        self.cache_pinned,
                    ) {
                        Some(delta) => {
                            debug!("replace added {delta} on heap");
                            encoded.set_on_heap_size(on_disk_substitute.on_heap_size() + delta);

                            entry.set_substitute(Arc::clone(&encoded));
                            entry.set_faulted(false);
                            installed = true;
                            old_element = self.decode(&on_disk_substitute);
                            self.free(&on_disk_substitute, false);

                            if let Some(disk_size) = on_disk_substitute.disk_size() {
                                let outgoing_disk_size = self.disk_pool.delete(disk_size as i64);
                                debug!("replace removed {outgoing_disk_size} from disk");
                            }
                            if let Some(old) = &old_element {
                                self.notifier.element_updated(old, &element);
                            }
                        }
                        None => {
                            debug!("replace failed to add on heap");
                            self.free(&encoded, false);
                            old_element = None;
                        }
                    }
                }
                None => {
                    self.free(&encoded, false);
                    old_element = None;
                }
            }
        }

        if installed {
            self.disk.installed(&encoded);
        }
        old_element
    }

    /// Replace the element mapped to this key only if currently mapped to
    /// the given element (compared with `comparator`).
    pub fn replace_if_equals(
        &self,
        key: &[u8],
        hash: u64,
        old_element: &Element,
        new_element: Element,
        comparator: &dyn ElementComparator,
    ) -> bool {
        let encoded = self.disk.create(new_element.clone());

        let mut installed = false;
        let replaced;
        {
            let state = self.state.write();
            let matched = state.find(key, hash).filter(|entry| {
                self.decode(&entry.substitute())
                    .map(|current| comparator.equals(old_element, &current))
                    .unwrap_or(false)
            });
            match matched {
                Some(entry) => {
                    // Re-fetch from the entry: the decode above may have
                    // faulted in a different substitute, and the size
                    // bookkeeping must target the live one.
                    let on_disk_substitute = entry.substitute();
                    match self.heap_pool.replace(
                        on_disk_substitute.on_heap_size(),
                        key,
                        Some(&encoded),
                        None,
                        self.cache_pinned,
                    ) {
                        Some(delta) => {
                            debug!("replace added {delta} on heap");
                            encoded.set_on_heap_size(on_disk_substitute.on_heap_size() + delta);

                            entry.set_substitute(Arc::clone(&encoded));
                            entry.set_faulted(false);
                            installed = true;
                            replaced = true;
                            self.free(&on_disk_substitute, false);

                            if let Some(disk_size) = on_disk_substitute.disk_size() {
                                let outgoing_disk_size = self.disk_pool.delete(disk_size as i64);
                                debug!("replace removed {outgoing_disk_size} from disk");
                            }
                            self.notifier.element_updated(old_element, &new_element);
                        }
                        None => {
                            debug!("replace failed to add on heap");
                            self.free(&encoded, false);
                            replaced = false;
                        }
                    }
                }
                None => {
                    self.free(&encoded, false);
                    replaced = false;
                }
            }
        }

        if installed {
            self.disk.installed(&encoded);
        }
        replaced
    }

    /// Remove the matching mapping.
    ///
    /// With `expected` given, the mapping is only removed when its decoded
    /// element matches via `comparator`; otherwise match on key alone.
    /// Returns the removed element.
    pub fn remove(
        &self,
        key: &[u8],
        hash: u64,
        expected: Option<&Element>,
        comparator: &dyn ElementComparator,
    ) -> Option<Element> {
        let mut state = self.state.write();
        self.remove_locked(&mut state, key, hash, expected, comparator, true)
    }

    /// Remove mechanics shared by `remove` and the fault rollback paths.
    /// Caller holds the write lock. The fault paths pass `notify = false`
    /// and classify the removal themselves.
    fn remove_locked(
        &self,
        state: &mut SegmentState,
        key: &[u8],
        hash: u64,
        expected: Option<&Element>,
        comparator: &dyn ElementComparator,
        notify: bool,
    ) -> Option<Element> {
        let chain = state.chain(hash);
        let pos = match chain.iter().position(|entry| entry.matches(key, hash)) {
            Some(pos) => pos,
            None => {
                debug!("remove deleted nothing");
                return None;
            }
        };

        let old_element = self.decode(&chain[pos].substitute());
        let matched = match (expected, &old_element) {
            (None, _) => true,
            (Some(expected), Some(current)) => comparator.equals(expected, current),
            (Some(_), None) => false,
        };
        if !matched {
            debug!("remove deleted nothing");
            return None;
        }

        state.unlink(hash, &chain, pos);

        // Re-fetch from the entry: the decode above may have faulted in a
        // different substitute, and the frees must target the live one.
        let on_disk_substitute = chain[pos].substitute();
        self.free(&on_disk_substitute, false);

        let outgoing_heap_size = self.heap_pool.delete(on_disk_substitute.on_heap_size());
        debug!("remove deleted {outgoing_heap_size} from heap");

        if let Some(disk_size) = on_disk_substitute.disk_size() {
            let outgoing_disk_size = self.disk_pool.delete(disk_size as i64);
            debug!("remove deleted {outgoing_disk_size} from disk");
        }

        if notify {
            if let Some(old) = &old_element {
                self.notifier.element_removed(old);
            }
        }
        old_element
    }

    /// Remove all mappings and zero both pool budgets.
    pub fn clear(&self) {
        let mut state = self.state.write();
        if state.count != 0 {
            for index in 0..state.table.len() {
                let mut cursor = state.table[index].take();
                while let Some(entry) = cursor {
                    self.free(&entry.substitute(), false);
                    cursor = entry.next.clone();
                }
            }
            state.mod_count += 1;
            state.count = 0;
        }
        self.heap_pool.clear();
        debug!("cleared heap usage");
        self.disk_pool.clear();
        debug!("cleared disk usage");
    }

    /// Remove the matching mapping, best effort.
    ///
    /// Unlike [`Segment::remove`] this matches the current substitute by
    /// pointer identity (no decode is needed to select the victim), only
    /// ever *tries* the write lock, and refuses to touch faulted entries
    /// (evicting a non-authoritative disk copy would lose data).
    ///
    /// Returns the evicted element, or `None` if the lock was contended,
    /// the entry was absent, faulted, or the substitute did not match.
    pub fn evict(
        &self,
        key: &[u8],
        hash: u64,
        expected: Option<&SubstituteRef>,
        notify: bool,
    ) -> Option<Element> {
        let mut state = self.state.try_write()?;

        let mut evicted_element = None;
        let chain = state.chain(hash);
        if let Some(pos) = chain.iter().position(|entry| entry.matches(key, hash)) {
            let entry = &chain[pos];
            if !entry.is_faulted() {
                evicted_element = self.decode(&entry.substitute());

                let identity_matched = expected
                    .map(|expected| Arc::ptr_eq(expected, &entry.substitute()))
                    .unwrap_or(true);
                if identity_matched && !entry.is_faulted() {
                    state.unlink(hash, &chain, pos);

                    let on_disk_substitute = entry.substitute();
                    self.free(&on_disk_substitute, false);

                    let outgoing_heap_size =
                        self.heap_pool.delete(on_disk_substitute.on_heap_size());
                    debug!("evicted {outgoing_heap_size} from heap");

                    if let Some(disk_size) = on_disk_substitute.disk_size() {
                        let outgoing_disk_size = self.disk_pool.delete(disk_size as i64);
                        debug!("evicted {outgoing_disk_size} from disk");
                    }
                } else {
                    evicted_element = None;
                }
            }
        }
        drop(state);

        if notify {
            if let Some(element) = &evicted_element {
                if element.is_expired() {
                    self.notifier.element_expired(element);
                } else {
                    self.notifier.element_evicted(element);
                }
            }
        }
        evicted_element
    }

    /// Atomically switch the `expect` representation of an entry for the
    /// `fault` disk marker, moving the value's budget from the heap tier
    /// to the disk tier.
    ///
    /// This is the multi-resource transaction the whole subsystem hinges
    /// on: a heap-pool delta and a disk-pool admission must both succeed,
    /// and the marker must only install while the entry still holds
    /// `expect` (pointer identity, under the write lock). Every exit path
    /// frees exactly what it speculatively reserved:
    ///
    /// - heap delta rejected: the entry is force-removed through the
    ///   eviction notification (a failed fault becomes an eviction rather
    ///   than inconsistent state);
    /// - disk admission rejected: the heap delta is reversed *forced* and
    ///   the entry force-removed through the eviction notification;
    /// - identity mismatch (another writer got there first): both
    ///   admissions are rolled back and the marker freed.
    ///
    /// With `skip_faulted` set, an entry that is already faulted aborts
    /// the switch, frees the marker, and still returns `true`. Nothing
    /// was installed, but downstream callers depend on this exact return
    /// value, so the quirk is preserved deliberately.
    pub fn fault(
        &self,
        key: &[u8],
        hash: u64,
        expect: &SubstituteRef,
        fault: SubstituteRef,
        skip_faulted: bool,
    ) -> bool {
        let mut state = self.state.write();
        self.fault_locked(&mut state, key, hash, expect, fault, skip_faulted)
    }

    fn fault_locked(
        &self,
        state: &mut SegmentState,
        key: &[u8],
        hash: u64,
        expect: &SubstituteRef,
        fault: SubstituteRef,
        skip_faulted: bool,
    ) -> bool {
        // Pinned segments never fault anything out; treat every entry as
        // already faulted.
        let mut faulted = self.cache_pinned;
        if state.count != 0 && !faulted {
            if let Some(entry) = state.find(key, hash) {
                faulted = entry.is_faulted();
            }

            if skip_faulted && faulted {
                self.free(&fault, false);
                return true;
            }

            let pinned = faulted || self.cache_pinned;
            let delta_heap_size = match self.heap_pool.replace(
                expect.on_heap_size(),
                key,
                Some(&fault),
                None,
                pinned,
            ) {
                Some(delta) => delta,
                None => {
                    // Policy: a failed fault becomes an eviction rather
                    // than leaving inconsistent state behind.
                    let removed = self.remove_locked(
                        state,
                        key,
                        hash,
                        None,
                        &DefaultElementComparator,
                        false,
                    );
                    if let Some(element) = removed {
                        self.notifier.element_evicted(&element);
                    }
                    self.free(&fault, true);
                    return false;
                }
            };
            fault.set_on_heap_size(expect.on_heap_size() + delta_heap_size);
            debug!("fault moved {delta_heap_size} on heap");

            let incoming_disk_size = match self.disk_pool.add(key, None, Some(&fault), pinned) {
                Some(size) => {
                    debug!("fault added {size} on disk");
                    size
                }
                None => {
                    // The reversal is forced (pinned): the heap bytes freed
                    // above may already have been claimed, so this may push
                    // the pool over budget, but it must not fail.
                    let reversal = self
                        .heap_pool
                        .replace(fault.on_heap_size(), key, Some(expect), None, true)
                        .unwrap_or(0);
                    debug!("fault failed to add on disk, moved {reversal} back to heap");
                    expect.set_on_heap_size(fault.on_heap_size() + reversal);

                    let removed = self.remove_locked(
                        state,
                        key,
                        hash,
                        None,
                        &DefaultElementComparator,
                        false,
                    );
                    if let Some(element) = removed {
                        self.notifier.element_evicted(&element);
                    }
                    self.free(&fault, true);
                    return false;
                }
            };

            if self.swap_if_identical(state, key, hash, expect, &fault) {
                return true;
            }

            // Another writer changed the entry between our speculation and
            // now: roll back both admissions. Same forced-reversal caveat
            // as above.
            let reversal = self
                .heap_pool
                .replace(fault.on_heap_size(), key, Some(expect), None, true)
                .unwrap_or(0);
            debug!("fault installation failed, moved {reversal} back to heap");
            expect.set_on_heap_size(fault.on_heap_size() + reversal);

            self.disk_pool.delete(incoming_disk_size);
            debug!("fault installation failed, deleted {incoming_disk_size} from disk");
        }
        self.free(&fault, true);
        false
    }

    /// Install `fault` into the entry for `key` only if its substitute is
    /// still pointer-identical to `expect`, freeing `expect` on success.
    fn swap_if_identical(
        &self,
        state: &SegmentState,
        key: &[u8],
        hash: u64,
        expect: &SubstituteRef,
        fault: &SubstituteRef,
    ) -> bool {
        if let Some(entry) = state.find(key, hash) {
            if Arc::ptr_eq(&entry.substitute(), expect) {
                entry.set_substitute(Arc::clone(fault));
                self.free(expect, false);
                return true;
            }
        }
        false
    }

    /// Mark an entry as flushable again (clear its faulted bit), evicting
    /// it instead when its placeholder failed to flush or the element has
    /// expired.
    ///
    /// Returns whether the faulted bit was actually cleared.
    pub fn flush(&self, key: &[u8], hash: u64, element: &Element) -> bool {
        let (cleared, substitute) = {
            let state = self.state.read();
            match state.find(key, hash) {
                Some(entry) => {
                    let cleared = entry
                        .faulted
                        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                    (cleared, Some(entry.substitute()))
                }
                None => (false, None),
            }
        };

        if let Some(substitute) = substitute {
            if substitute.is_placeholder() && substitute.failed_to_flush() {
                self.evict(key, hash, Some(&substitute), true);
            } else if element.is_expired() {
                self.evict(key, hash, Some(&substitute), true);
            }
        }
        cleared
    }

    /// Check whether a placeholder that failed to flush is still mapped
    /// for this key, and if so evict it quietly.
    ///
    /// Returns `true` when a failed placeholder was found (whether or not
    /// the opportunistic evict won the lock).
    pub fn clean_up_failed_marker(&self, key: &[u8], hash: u64) -> bool {
        let failed = {
            let state = self.state.read();
            state.find(key, hash).and_then(|entry| {
                let substitute = entry.substitute();
                (substitute.is_placeholder() && substitute.failed_to_flush())
                    .then_some(substitute)
            })
        };
        match failed {
            Some(substitute) => {
                self.evict(key, hash, Some(&substitute), false);
                true
            }
            None => false,
        }
    }

    /// Clear the faulted bit on every entry.
    pub fn clear_faulted_bit(&self) {
        let state = self.state.write();
        for bucket in &state.table {
            let mut cursor = bucket.as_ref();
            while let Some(entry) = cursor {
                entry.set_faulted(false);
                cursor = entry.next.as_ref();
            }
        }
    }

    /// Double the bucket table. Caller holds the write lock.
    ///
    /// For each old bucket the longest trailing run whose target index is
    /// unchanged under the new mask is relinked as-is; only the nodes
    /// ahead of it are cloned. The new table is published in one
    /// assignment once fully built, so a traversal of the old table stays
    /// valid throughout.
    fn rehash(&self, state: &mut SegmentState) {
        let old_capacity = state.table.len();
        if old_capacity >= MAXIMUM_CAPACITY {
            return;
        }

        let new_capacity = old_capacity << 1;
        let size_mask = new_capacity - 1;
        let mut new_table: Vec<Option<Arc<HashEntry>>> = vec![None; new_capacity];

        for bucket in &state.table {
            let Some(first) = bucket else { continue };

            if first.next.is_none() {
                // Single node on list
                let index = (first.hash as usize) & size_mask;
                new_table[index] = Some(Arc::clone(first));
                continue;
            }

            // Reuse the trailing consecutive sequence targeting one slot
            let mut chain = Vec::new();
            let mut cursor = Some(Arc::clone(first));
            while let Some(entry) = cursor {
                cursor = entry.next.clone();
                chain.push(entry);
            }

            let mut last_run = 0;
            let mut last_index = (chain[0].hash as usize) & size_mask;
            for (pos, entry) in chain.iter().enumerate().skip(1) {
                let index = (entry.hash as usize) & size_mask;
                if index != last_index {
                    last_index = index;
                    last_run = pos;
                }
            }
            new_table[last_index] = Some(Arc::clone(&chain[last_run]));

            // Clone all nodes ahead of the reused run
            for entry in &chain[..last_run] {
                let index = (entry.hash as usize) & size_mask;
                let head = new_table[index].take();
                new_table[index] = Some(HashEntry::new(
                    entry.key.clone(),
                    entry.hash,
                    head,
                    entry.substitute(),
                    Arc::clone(&entry.faulted),
                ));
            }
        }

        state.threshold = (new_capacity as f32 * self.load_factor) as usize;
        state.table = new_table;
    }

    /// Collect up to `sample_size` non-faulted substitutes matching
    /// `filter`, scanning circularly from a bucket derived from `seed`.
    ///
    /// Candidate selection never decodes: forcing disk I/O to pick an
    /// eviction victim would defeat the point. The scan stops after one
    /// full pass even if the sample is short.
    pub fn add_random_sample<F>(
        &self,
        filter: F,
        sample_size: usize,
        sampled: &mut Vec<SubstituteRef>,
        seed: usize,
    ) where
        F: Fn(&SubstituteRef) -> bool,
    {
        let state = self.state.read();
        if state.count == 0 {
            return;
        }
        let mask = state.table.len() - 1;
        let table_start = seed & mask;
        let mut table_index = table_start;
        loop {
            let mut cursor = state.table[table_index].as_ref();
            while let Some(entry) = cursor {
                let substitute = entry.substitute();
                if !entry.is_faulted() && filter(&substitute) {
                    sampled.push(substitute);
                }
                cursor = entry.next.as_ref();
            }

            if sampled.len() >= sample_size {
                return;
            }

            table_index = (table_index + 1) & mask;
            if table_index == table_start {
                return;
            }
        }
    }

    /// A weakly-consistent iterator over the segment's entries.
    ///
    /// Snapshots the table reference under the read lock and then walks
    /// chains without any lock. Entries removed or inserted concurrently
    /// may be skipped or revisited; traversal is never corrupted because
    /// published nodes are never relinked in place.
    pub fn iter(&self) -> SegmentIter {
        let table = self.state.read().table.clone();
        SegmentIter {
            table,
            bucket: 0,
            cursor: None,
        }
    }
}

/// Iterator over a segment's [`HashEntry`] nodes. See [`Segment::iter`].
pub struct SegmentIter {
    table: Vec<Option<Arc<HashEntry>>>,
    bucket: usize,
    cursor: Option<Arc<HashEntry>>,
}

impl Iterator for SegmentIter {
    type Item = Arc<HashEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.cursor.take() {
                self.cursor = entry.next.clone();
                return Some(entry);
            }
            if self.bucket >= self.table.len() {
                return None;
            }
            self.cursor = self.table[self.bucket].clone();
            self.bucket += 1;
        }
    }
}
