//! Segment configuration.

use crate::error::{StoreError, StoreResult};

/// Largest permitted bucket table size.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Configuration for a [`crate::Segment`].
///
/// Built with chained `with_*` methods; validated by
/// [`SegmentConfig::validated`], which the segment constructor calls.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Initial bucket count, rounded up to a power of two.
    pub initial_capacity: usize,
    /// Fraction of the table size at which a rehash is triggered.
    pub load_factor: f32,
    /// Whether the whole cache is pinned in memory. Pinned segments never
    /// fault entries out to disk and bias every admission.
    pub cache_pinned: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            load_factor: 0.75,
            cache_pinned: false,
        }
    }
}

impl SegmentConfig {
    /// Create a config with default values (16 buckets, 0.75 load factor,
    /// not pinned).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial bucket count (rounded up to a power of two).
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the load factor.
    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Pin the cache in memory.
    pub fn with_cache_pinned(mut self, pinned: bool) -> Self {
        self.cache_pinned = pinned;
        self
    }

    /// Validate the config and normalize the capacity to a power of two.
    pub fn validated(mut self) -> StoreResult<Self> {
        if self.initial_capacity == 0 {
            return Err(StoreError::InvalidConfig("capacity must be non-zero"));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(StoreError::InvalidConfig(
                "load factor must be in (0, 1]",
            ));
        }
        self.initial_capacity = self
            .initial_capacity
            .next_power_of_two()
            .min(MAXIMUM_CAPACITY);
        Ok(self)
    }
}
