//! Cache event notification.
//!
//! Put, update and remove notifications fire while the segment write lock
//! is held, which gives per-key ordering relative to other mutations of the
//! same key. Eviction and expiry notifications fire after the lock is
//! released (except the fault rollback paths, which announce the forced
//! eviction while still holding the lock); they only describe entries that
//! are already gone.

use crate::element::Element;

/// Receiver for segment lifecycle events.
pub trait CacheEventNotifier: Send + Sync {
    /// A new mapping was inserted.
    fn element_put(&self, element: &Element);

    /// An existing mapping's value was replaced.
    fn element_updated(&self, old: &Element, new: &Element);

    /// A mapping was removed by an explicit remove.
    fn element_removed(&self, element: &Element);

    /// A mapping was removed by the eviction path.
    fn element_evicted(&self, element: &Element);

    /// A mapping was removed because it had expired.
    fn element_expired(&self, element: &Element);
}

/// Notifier that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl CacheEventNotifier for NoopNotifier {
    fn element_put(&self, _element: &Element) {}
    fn element_updated(&self, _old: &Element, _new: &Element) {}
    fn element_removed(&self, _element: &Element) {}
    fn element_evicted(&self, _element: &Element) {}
    fn element_expired(&self, _element: &Element) {}
}
