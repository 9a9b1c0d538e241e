//! Cached element representation and key hashing.

use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed seeds so key hashes are stable for the life of the process.
/// Segments receive precomputed hashes, so every caller must hash the
/// same way.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x6c62_272e_07bb_0142,
    0x62b8_2175_6295_c58d,
    0x5851_f42d_4c95_7f2d,
    0x1405_7b7e_f767_814f,
);

/// Compute the spread hash for a key.
///
/// Uses ahash with fixed seeds. The segment itself never hashes keys; the
/// sharding layer above it computes this once and passes it to every
/// operation, exactly as the bucket index derivation expects.
pub fn hash_key(key: &[u8]) -> u64 {
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = ahash::RandomState::with_seeds(
        HASH_SEEDS.0,
        HASH_SEEDS.1,
        HASH_SEEDS.2,
        HASH_SEEDS.3,
    )
    .build_hasher();
    hasher.write(key);
    hasher.finish()
}

/// Current wall-clock time in seconds since the Unix epoch.
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// A key-value pair stored in the cache.
///
/// `expire_at` is seconds since the Unix epoch; 0 means the element never
/// expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    key: Box<[u8]>,
    value: Box<[u8]>,
    expire_at: u32,
}

impl Element {
    /// Create an element that never expires.
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self::with_expiry(key, value, 0)
    }

    /// Create an element with an absolute expiration time in epoch seconds.
    pub fn with_expiry(key: &[u8], value: &[u8], expire_at: u32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expire_at,
        }
    }

    /// The element's key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The element's value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Absolute expiration time in epoch seconds (0 = never).
    pub fn expire_at(&self) -> u32 {
        self.expire_at
    }

    /// Whether the element has passed its expiration time.
    pub fn is_expired(&self) -> bool {
        self.expire_at != 0 && self.expire_at <= now_secs()
    }
}

/// Value comparison used by the optimistic remove/replace variants.
pub trait ElementComparator: Send + Sync {
    /// Whether two elements should be considered equal.
    fn equals(&self, a: &Element, b: &Element) -> bool;
}

/// Compares elements by their value bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultElementComparator;

impl ElementComparator for DefaultElementComparator {
    fn equals(&self, a: &Element, b: &Element) -> bool {
        a.value() == b.value()
    }
}
