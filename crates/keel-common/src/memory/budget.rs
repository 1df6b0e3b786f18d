//! Cache memory accounting.
//!
//! `MemoryBudget` tracks how many bytes of the shared cache are consumed by
//! bookkeeping structures such as the lock table. It is pure accounting: the
//! charge and credit sites record deltas, and the eviction layer reads the
//! totals to decide when to shed cached pages. Nothing here refuses a charge.
//!
//! Usage is split into per-shard buckets so that concurrent charge sites do
//! not contend on a single counter. Each bucket is padded to its own cache
//! line; totals are computed by summing buckets on read.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::memory::CacheLineAligned;

/// Byte accountant for cache-resident bookkeeping.
///
/// Deltas are applied to a bucket chosen by the caller (lock-table shards
/// use their shard index), so a hot shard never dirties another shard's
/// counter. All methods take `&self`; the budget is shared via `Arc` across
/// every component that charges into it.
pub struct MemoryBudget {
    /// Upper bound the evictor steers toward. Never enforced here.
    max_bytes: u64,
    /// Per-bucket usage in bytes. Signed so transient over-credits during
    /// teardown are representable rather than panicking.
    buckets: Box<[CacheLineAligned<AtomicI64>]>,
}

impl MemoryBudget {
    /// Creates a budget with the given byte ceiling and bucket count.
    ///
    /// A bucket count of zero is rounded up to one.
    #[must_use]
    pub fn new(max_bytes: u64, n_buckets: usize) -> Self {
        let buckets = (0..n_buckets.max(1))
            .map(|_| CacheLineAligned::new(AtomicI64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { max_bytes, buckets }
    }

    /// Returns the number of buckets.
    #[inline]
    #[must_use]
    pub fn n_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the configured byte ceiling.
    #[inline]
    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Applies a signed delta to one bucket.
    #[inline]
    pub fn adjust(&self, bucket: usize, delta: i64) {
        self.buckets[bucket].fetch_add(delta, Ordering::Relaxed);
    }

    /// Charges bytes to one bucket.
    #[inline]
    pub fn charge(&self, bucket: usize, bytes: u64) {
        self.adjust(bucket, bytes as i64);
    }

    /// Credits bytes back to one bucket.
    #[inline]
    pub fn credit(&self, bucket: usize, bytes: u64) {
        self.adjust(bucket, -(bytes as i64));
    }

    /// Returns the usage recorded in one bucket.
    #[inline]
    #[must_use]
    pub fn bucket_usage(&self, bucket: usize) -> i64 {
        self.buckets[bucket].load(Ordering::Relaxed)
    }

    /// Returns total usage across all buckets.
    ///
    /// The sum is not a point-in-time snapshot under concurrent updates,
    /// which is fine for the eviction heuristics that consume it.
    #[must_use]
    pub fn usage(&self) -> i64 {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Returns bytes left before the ceiling. Negative when over budget.
    #[must_use]
    pub fn remaining(&self) -> i64 {
        self.max_bytes as i64 - self.usage()
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("max_bytes", &self.max_bytes)
            .field("n_buckets", &self.buckets.len())
            .field("usage", &self.usage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_budget_is_empty() {
        let budget = MemoryBudget::new(1024, 4);
        assert_eq!(budget.n_buckets(), 4);
        assert_eq!(budget.max_bytes(), 1024);
        assert_eq!(budget.usage(), 0);
        assert_eq!(budget.remaining(), 1024);
    }

    #[test]
    fn test_zero_buckets_rounds_up() {
        let budget = MemoryBudget::new(1024, 0);
        assert_eq!(budget.n_buckets(), 1);
    }

    #[test]
    fn test_charge_credit_conservation() {
        let budget = MemoryBudget::new(4096, 2);
        budget.charge(0, 100);
        budget.charge(1, 50);
        assert_eq!(budget.usage(), 150);
        budget.credit(0, 100);
        budget.credit(1, 50);
        assert_eq!(budget.usage(), 0);
    }

    #[test]
    fn test_buckets_are_independent() {
        let budget = MemoryBudget::new(4096, 3);
        budget.charge(1, 64);
        assert_eq!(budget.bucket_usage(0), 0);
        assert_eq!(budget.bucket_usage(1), 64);
        assert_eq!(budget.bucket_usage(2), 0);
    }

    #[test]
    fn test_adjust_signed() {
        let budget = MemoryBudget::new(4096, 1);
        budget.adjust(0, 80);
        budget.adjust(0, -30);
        assert_eq!(budget.usage(), 50);
    }

    #[test]
    fn test_remaining_goes_negative() {
        let budget = MemoryBudget::new(10, 1);
        budget.charge(0, 25);
        assert_eq!(budget.remaining(), -15);
    }

    #[test]
    fn test_debug_format() {
        let budget = MemoryBudget::new(100, 2);
        budget.charge(0, 10);
        let s = format!("{:?}", budget);
        assert!(s.contains("MemoryBudget"));
        assert!(s.contains("usage"));
    }
}
