//! Byte-budget admission control for the heap and disk tiers.
//!
//! Each segment holds two [`PoolAccessor`]s, one per tier. Every admission
//! returned by `add`/`replace` must eventually be matched by exactly one
//! `delete` of the same size; the segment tracks the admitted size on the
//! substitute itself to make that pairing explicit.

use crate::substitute::SubstituteRef;
use crate::sync::{AtomicI64, Ordering};
use log::debug;

/// Approximate fixed heap overhead of one decoded or placeholder value
/// (entry node, substitute header, allocator slack).
const ELEMENT_OVERHEAD: i64 = 64;

/// Approximate fixed heap overhead of a disk marker.
const MARKER_OVERHEAD: i64 = 40;

/// A per-tier byte-budget tracker.
///
/// `None` from `add`/`replace` is the rejection sentinel: the reservation
/// was not made and nothing needs to be released. Pinned admissions and
/// replaces must never reject; the fault rollback path depends on forced
/// reversals succeeding.
pub trait PoolAccessor: Send + Sync {
    /// Admit a new reservation sized from `key` plus the given substitute
    /// references. Returns the admitted byte count, or `None` on rejection.
    fn add(
        &self,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
        pinned: bool,
    ) -> Option<i64>;

    /// Replace an existing reservation of `current_size` bytes with one
    /// sized for the given references. Returns the signed size delta that
    /// was applied, or `None` on rejection (in which case the existing
    /// reservation is untouched).
    fn replace(
        &self,
        current_size: i64,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
        pinned: bool,
    ) -> Option<i64>;

    /// Release `size` bytes. Returns the released byte count.
    fn delete(&self, size: i64) -> i64;

    /// Drop all reservations.
    fn clear(&self);

    /// Whether a reservation for the given references would fit without
    /// displacing anything.
    fn can_add_without_evicting(
        &self,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
    ) -> bool;
}

/// Which tier a [`BoundedPool`] accounts for.
///
/// The same substitute costs different amounts per tier: a disk marker is a
/// few dozen heap bytes but its full payload size on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTier {
    /// Sizes in-heap footprints (key + value bytes + fixed overheads).
    Heap,
    /// Sizes on-disk footprints (marker payload bytes only).
    Disk,
}

/// Simple capacity-bounded pool accessor.
///
/// Tracks used bytes with a single atomic counter. Unpinned admissions that
/// would push usage past the capacity are rejected; pinned ones always
/// succeed, even past the limit.
pub struct BoundedPool {
    tier: PoolTier,
    capacity: i64,
    used: AtomicI64,
}

impl BoundedPool {
    /// Create a pool accounting for the given tier with a byte capacity.
    pub fn new(tier: PoolTier, capacity: i64) -> Self {
        Self {
            tier,
            capacity,
            used: AtomicI64::new(0),
        }
    }

    /// Bytes currently reserved.
    pub fn used_bytes(&self) -> i64 {
        self.used.load(Ordering::Acquire)
    }

    /// Configured byte capacity.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    fn substitute_size(&self, key: &[u8], substitute: &SubstituteRef) -> i64 {
        match self.tier {
            PoolTier::Heap => match substitute.in_heap_element() {
                Some(element) => {
                    ELEMENT_OVERHEAD + key.len() as i64 + element.value().len() as i64
                }
                None => MARKER_OVERHEAD + key.len() as i64,
            },
            PoolTier::Disk => substitute.disk_size().map(|s| s as i64).unwrap_or(0),
        }
    }

    fn footprint(
        &self,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
    ) -> i64 {
        value
            .iter()
            .chain(placeholder.iter())
            .map(|s| self.substitute_size(key, s))
            .sum()
    }
}

impl PoolAccessor for BoundedPool {
    fn add(
        &self,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
        pinned: bool,
    ) -> Option<i64> {
        let size = self.footprint(key, value, placeholder);
        loop {
            let used = self.used.load(Ordering::Acquire);
            if !pinned && used + size > self.capacity {
                debug!("pool rejected add of {size} bytes ({used} used of {})", self.capacity);
                return None;
            }
            if self
                .used
                .compare_exchange(used, used + size, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(size);
            }
        }
    }

    fn replace(
        &self,
        current_size: i64,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
        pinned: bool,
    ) -> Option<i64> {
        let delta = self.footprint(key, value, placeholder) - current_size;
        loop {
            let used = self.used.load(Ordering::Acquire);
            if !pinned && delta > 0 && used + delta > self.capacity {
                debug!(
                    "pool rejected replace delta of {delta} bytes ({used} used of {})",
                    self.capacity
                );
                return None;
            }
            if self
                .used
                .compare_exchange(used, used + delta, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(delta);
            }
        }
    }

    fn delete(&self, size: i64) -> i64 {
        self.used.fetch_sub(size, Ordering::AcqRel);
        size
    }

    fn clear(&self) {
        self.used.store(0, Ordering::Release);
    }

    fn can_add_without_evicting(
        &self,
        key: &[u8],
        value: Option<&SubstituteRef>,
        placeholder: Option<&SubstituteRef>,
    ) -> bool {
        let size = self.footprint(key, value, placeholder);
        self.used.load(Ordering::Acquire) + size <= self.capacity
    }
}
