//! Cache-line alignment utilities.
//!
//! Concurrent counters that live side by side in one allocation invalidate
//! each other's cache lines on every write. Padding each counter out to its
//! own line keeps unrelated updates independent.

use std::ops::{Deref, DerefMut};

/// Alignment granularity for padded values. 64 bytes covers x86-64 and
/// current aarch64 parts.
pub const CACHE_LINE_SIZE: usize = 64;

/// Pads `T` out to a full cache line.
///
/// The memory budget allocates its per-bucket counters back to back in one
/// slice. Without padding, a store into one bucket would invalidate the line
/// holding its neighbors and serialize updates that are logically
/// independent. Access goes through `Deref`, so the wrapper disappears at
/// the use site.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CacheLineAligned<T> {
    value: T,
}

impl<T> CacheLineAligned<T> {
    /// Wraps a value, padding it to `CACHE_LINE_SIZE`.
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CacheLineAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for CacheLineAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}
