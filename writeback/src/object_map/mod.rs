//! Track which backing objects of an image may exist.
//!
//! The object map lets reads of objects that were never written skip the store entirely. Once
//! the map can no longer be trusted (see [InvalidateRequest]) the image stops consulting it and
//! every object is assumed to possibly exist.

mod invalidate;
pub use invalidate::InvalidateRequest;

/// Existence predicate over the backing objects of an image.
pub trait ObjectMap: Send + Sync + 'static {
    /// Returns false only if object `object_no` is known not to exist.
    fn object_may_exist(&self, object_no: u64) -> bool;
}
