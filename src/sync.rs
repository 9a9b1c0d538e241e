//! Synchronization primitives with optional loom support.
//!
//! This module re-exports the atomic types the store needs so they can be
//! swapped for loom's model-checked versions when the `loom` feature is
//! enabled, while production builds use plain std atomics.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicI64, Ordering};
