//! A lock-sharded, two-tier (heap + disk) hash store core.
//!
//! The central type is [`Segment`], one independently-locked shard of a
//! larger store. Each mapping is represented by a [`Substitute`] that
//! migrates between tiers under the control of a [`DiskStorageFactory`],
//! while two [`PoolAccessor`]s keep the heap and disk byte budgets honest.
//!
//! ```text
//!                ┌────────────────────────────────────────┐
//!                │                Segment                 │
//!                │  RwLock ─ bucket table ─ HashEntry*    │
//!                └───────┬───────────────────┬────────────┘
//!                        │                   │
//!              admission │                   │ encode/decode
//!                        ▼                   ▼
//!        ┌──────────────────────┐   ┌────────────────────┐
//!        │ PoolAccessor (heap)  │   │ DiskStorageFactory │
//!        │ PoolAccessor (disk)  │   │  Decoded → Marker  │
//!        └──────────────────────┘   └────────────────────┘
//! ```
//!
//! # Design highlights
//!
//! - Bucket chains are immutable once published; edits clone the prefix
//!   and reuse the suffix, so weakly-consistent iteration and sampling
//!   never see a corrupt chain.
//! - Expensive value encodes happen outside the segment lock; only the
//!   install is exclusive.
//! - A per-entry *faulted* bit marks mappings whose authoritative copy
//!   lives in a higher tier; eviction refuses to touch them.
//! - The fault transaction ([`Segment::fault`]) swaps a heap
//!   representation for a disk marker atomically across both pool
//!   budgets, rolling back every reservation on any failure.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod element;
mod error;
mod notify;
mod pool;
mod segment;
mod substitute;
mod sync;

pub use config::SegmentConfig;
pub use element::{hash_key, DefaultElementComparator, Element, ElementComparator};
pub use error::{StoreError, StoreResult};
pub use notify::{CacheEventNotifier, NoopNotifier};
pub use pool::{BoundedPool, PoolAccessor, PoolTier};
pub use segment::{HashEntry, Segment, SegmentIter};
pub use substitute::{DiskStorageFactory, Substitute, SubstituteKind, SubstituteRef};
