//! Sharded lock table.
//!
//! Resources hash to shards by LSN modulo shard count, and each shard is
//! an independently latched map. All per-lock mutation happens under one
//! shard latch; nothing in the crate ever holds two shard latches at once,
//! so shard ordering never deadlocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use keel_common::memory::MemoryBudget;
use keel_common::types::{LockerId, Lsn};

use crate::lock::Lock;
use crate::locker::Locker;
use crate::wait::WaitHandle;

/// Budget bucket a shard's footprint is charged to. Identity when the
/// budget carries one bucket per shard, wrapping otherwise.
pub(crate) fn budget_bucket(budget: &MemoryBudget, shard: usize) -> usize {
    shard % budget.n_buckets()
}

/// One blocked waiter observed during a deadlock sweep, together with the
/// owners that conflict with it. `shard` lets the detector re-latch the
/// right shard when it aborts the victim.
pub(crate) struct WaitSnapshot {
    pub resource: Lsn,
    pub shard: usize,
    pub locker: Arc<Locker>,
    pub handle: Arc<WaitHandle>,
    pub blockers: Vec<LockerId>,
}

pub(crate) struct Shard {
    pub locks: Mutex<HashMap<Lsn, Lock>>,
}

pub(crate) struct LockTable {
    shards: Box<[Shard]>,
    /// Queued waiters across all shards. Drives detector arming; kept
    /// outside the shard latches so arming never contends with lock traffic.
    waiters: AtomicUsize,
}

impl LockTable {
    pub(crate) fn new(n_shards: usize) -> Self {
        let n = n_shards.max(1);
        let mut shards = Vec::with_capacity(n);
        for _ in 0..n {
            shards.push(Shard {
                locks: Mutex::new(HashMap::new()),
            });
        }
        Self {
            shards: shards.into_boxed_slice(),
            waiters: AtomicUsize::new(0),
        }
    }

    pub(crate) fn n_shards(&self) -> usize {
        self.shards.len()
    }

    pub(crate) fn shard_index(&self, resource: Lsn) -> usize {
        (resource.as_u64() % self.shards.len() as u64) as usize
    }

    pub(crate) fn shard(&self, idx: usize) -> &Shard {
        &self.shards[idx]
    }

    /// Number of live lock entries, summed shard by shard. Not a consistent
    /// cut; fine for diagnostics and tests that have quiesced.
    pub(crate) fn lock_count(&self) -> usize {
        self.shards.iter().map(|s| s.locks.lock().len()).sum()
    }

    pub(crate) fn add_waiter(&self) {
        self.waiters.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_waiter(&self) {
        self.waiters.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Collects every blocked waiter, one shard latch at a time in index
    /// order. The result is not a consistent cut across shards; the
    /// detector re-validates under the latch before aborting anyone.
    pub(crate) fn snapshot_waits(&self) -> Vec<WaitSnapshot> {
        let mut out = Vec::new();
        for (idx, shard) in self.shards.iter().enumerate() {
            let locks = shard.locks.lock();
            for (resource, lock) in locks.iter() {
                lock.collect_waits(*resource, idx, &mut out);
            }
        }
        out
    }
}
