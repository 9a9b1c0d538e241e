//! Value substitutes and the disk storage factory contract.
//!
//! A stored value is always represented by a [`Substitute`] attached to its
//! hash entry. The substitute moves through a small state machine as the
//! value migrates between tiers:
//!
//! - [`SubstituteKind::Decoded`]: the value lives fully in memory.
//! - [`SubstituteKind::Placeholder`]: in memory, queued for a disk flush; a
//!   failed flush is recorded on the placeholder rather than raised, so the
//!   segment can lazily evict the poisoned entry.
//! - [`SubstituteKind::DiskMarker`]: the value lives on disk; only the
//!   marker (location + size) stays in memory.
//!
//! Substitutes are reference counted and compared by pointer identity
//! (`Arc::ptr_eq`) wherever the tiering protocol needs to know "is this
//! still the representation I speculated against".

use crate::element::Element;
use crate::sync::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Shared handle to a substitute. Exactly one hash entry owns a given
/// substitute at any time; other references are transient.
pub type SubstituteRef = Arc<Substitute>;

/// One representation of a stored value.
#[derive(Debug)]
pub struct Substitute {
    kind: SubstituteKind,
    /// Heap bytes last admitted to the heap pool for this substitute.
    /// Updated under the segment write lock whenever an admission or
    /// incremental replace succeeds; the matching release must use this
    /// exact figure.
    on_heap_size: AtomicI64,
}

/// The state a substitute is in.
#[derive(Debug)]
pub enum SubstituteKind {
    /// Fully decoded in-heap value.
    Decoded(Element),

    /// In-heap value awaiting its disk flush.
    Placeholder {
        /// The value, still authoritative until the flush completes.
        element: Element,
        /// Set by the factory when the flush failed; the segment evicts
        /// such entries on next access instead of failing synchronously.
        failed_to_flush: AtomicBool,
    },

    /// Disk-resident value; memory holds only this marker.
    DiskMarker {
        /// Opaque location understood by the owning factory.
        location: u64,
        /// Bytes occupied on disk, as admitted to the disk pool.
        size_on_disk: u64,
        /// Expiration carried alongside the marker so restart-time sweeps
        /// can judge it without a decode.
        expire_at: u32,
    },
}

impl Substitute {
    /// Create a decoded in-heap substitute.
    pub fn decoded(element: Element) -> SubstituteRef {
        Arc::new(Self {
            kind: SubstituteKind::Decoded(element),
            on_heap_size: AtomicI64::new(0),
        })
    }

    /// Create a placeholder awaiting flush.
    pub fn placeholder(element: Element) -> SubstituteRef {
        Arc::new(Self {
            kind: SubstituteKind::Placeholder {
                element,
                failed_to_flush: AtomicBool::new(false),
            },
            on_heap_size: AtomicI64::new(0),
        })
    }

    /// Create a disk marker for a persisted value.
    pub fn disk_marker(location: u64, size_on_disk: u64, expire_at: u32) -> SubstituteRef {
        Arc::new(Self {
            kind: SubstituteKind::DiskMarker {
                location,
                size_on_disk,
                expire_at,
            },
            on_heap_size: AtomicI64::new(0),
        })
    }

    /// The substitute's current state.
    pub fn kind(&self) -> &SubstituteKind {
        &self.kind
    }

    /// Heap bytes last recorded for this substitute.
    pub fn on_heap_size(&self) -> i64 {
        self.on_heap_size.load(Ordering::Acquire)
    }

    /// Record the heap bytes admitted for this substitute.
    pub fn set_on_heap_size(&self, size: i64) {
        self.on_heap_size.store(size, Ordering::Release);
    }

    /// Whether this substitute is a disk marker.
    pub fn is_disk_marker(&self) -> bool {
        matches!(self.kind, SubstituteKind::DiskMarker { .. })
    }

    /// Whether this substitute is a placeholder awaiting flush.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, SubstituteKind::Placeholder { .. })
    }

    /// Disk bytes held by this substitute, if it is a disk marker.
    pub fn disk_size(&self) -> Option<u64> {
        match &self.kind {
            SubstituteKind::DiskMarker { size_on_disk, .. } => Some(*size_on_disk),
            _ => None,
        }
    }

    /// Disk location, if this substitute is a disk marker.
    pub fn location(&self) -> Option<u64> {
        match &self.kind {
            SubstituteKind::DiskMarker { location, .. } => Some(*location),
            _ => None,
        }
    }

    /// The in-heap element, if the value has not moved to disk.
    pub fn in_heap_element(&self) -> Option<&Element> {
        match &self.kind {
            SubstituteKind::Decoded(element) => Some(element),
            SubstituteKind::Placeholder { element, .. } => Some(element),
            SubstituteKind::DiskMarker { .. } => None,
        }
    }

    /// Whether a placeholder's flush has failed.
    ///
    /// Always `false` for non-placeholders.
    pub fn failed_to_flush(&self) -> bool {
        match &self.kind {
            SubstituteKind::Placeholder {
                failed_to_flush, ..
            } => failed_to_flush.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Mark a placeholder's flush as failed. No-op for non-placeholders.
    pub fn mark_failed_to_flush(&self) {
        if let SubstituteKind::Placeholder {
            failed_to_flush, ..
        } = &self.kind
        {
            failed_to_flush.store(true, Ordering::Release);
        }
    }
}

/// The disk tier collaborator.
///
/// The factory owns everything about how values physically reach disk; the
/// segment only drives the protocol. `create` must be cheap (a real factory
/// returns a placeholder and flushes asynchronously). `retrieve` may block
/// on disk I/O. `free` must tolerate being called more than once for the
/// same substitute.
pub trait DiskStorageFactory: Send + Sync {
    /// Encode an element into a substitute. Called outside any segment lock.
    fn create(&self, element: Element) -> SubstituteRef;

    /// Decode a substitute back to its element. `hit` is set when the
    /// lookup should count toward the factory's hit accounting. Returns
    /// `None` when the backing data cannot be read.
    fn retrieve(&self, substitute: &SubstituteRef, hit: bool) -> Option<Element>;

    /// Release any disk-side resource held by the substitute.
    /// `fault_failure` is set when the release happens because a tiering
    /// fault was aborted mid-flight.
    fn free(&self, substitute: &SubstituteRef, fault_failure: bool);

    /// Called after the segment lock is released when a substitute created
    /// by [`DiskStorageFactory::create`] got installed into an entry. A
    /// real factory schedules the disk flush here.
    fn installed(&self, substitute: &SubstituteRef) {
        let _ = substitute;
    }
}
