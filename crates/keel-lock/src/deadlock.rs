//! Deadlock detection.
//!
//! Waiters and the owners blocking them are snapshotted shard by shard
//! into a wait-for graph; every cycle gets one victim aborted. The
//! snapshot is not a consistent cut, so a victim is only aborted after
//! re-checking, under its shard latch, that it is still waiting. A wait
//! that resolved in the meantime simply drops out.
//!
//! Detection runs on a dedicated thread armed by the first enqueue. The
//! thread sleeps for a short delay before sweeping, since most contention
//! resolves by itself, and re-arms while waiters remain parked. Managers
//! configured without the thread run explicit passes on their own
//! schedule instead.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use keel_common::memory::MemoryBudget;
use keel_common::types::LockerId;

use crate::manager::{LockEventListener, LockStats};
use crate::table::{budget_bucket, LockTable, WaitSnapshot};

/// One detected cycle and the locker chosen to break it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// The cycle, rotated so its smallest locker id comes first. Each
    /// entry waits on the next; the last waits on the first.
    pub cycle: Vec<LockerId>,
    /// The member that will be aborted.
    pub victim: LockerId,
}

/// Wait-for graph over lockers.
///
/// An edge `waiter -> blocker` means the waiter's queued request conflicts
/// with a lock the blocker currently owns.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: HashMap<LockerId, Vec<LockerId>>,
    priorities: HashMap<LockerId, i32>,
}

impl WaitForGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` is blocked by `blocker`.
    pub fn add_wait(&mut self, waiter: LockerId, blocker: LockerId) {
        self.edges.entry(waiter).or_default().push(blocker);
    }

    /// Records a locker's abort priority. Unrecorded lockers default to 0.
    pub fn set_priority(&mut self, locker: LockerId, priority: i32) {
        self.priorities.insert(locker, priority);
    }

    /// Finds every distinct cycle reachable in the graph and picks a
    /// victim for each. Starts are visited in id order, so the result is
    /// deterministic for a given graph.
    ///
    /// Overlapping cycles sharing an edge may surface one at a time; the
    /// detector re-arms after each pass, so the rest are caught as soon
    /// as the first victim's edges are gone.
    #[must_use]
    pub fn detect(&self) -> Vec<DeadlockInfo> {
        let mut starts: Vec<LockerId> = self.edges.keys().copied().collect();
        starts.sort_unstable();

        let mut seen: HashSet<Vec<LockerId>> = HashSet::new();
        let mut found = Vec::new();
        for start in starts {
            if let Some(cycle) = self.find_cycle_from(start) {
                let cycle = normalize_cycle(&cycle);
                if seen.insert(cycle.clone()) {
                    let victim = self.select_victim(&cycle);
                    found.push(DeadlockInfo { cycle, victim });
                }
            }
        }
        found
    }

    /// Runs a depth-first search from `start` and returns the first cycle
    /// it closes, in wait order.
    #[must_use]
    pub fn find_cycle_from(&self, start: LockerId) -> Option<Vec<LockerId>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        self.dfs(start, &mut path, &mut visited)
    }

    fn dfs(
        &self,
        current: LockerId,
        path: &mut Vec<LockerId>,
        visited: &mut HashSet<LockerId>,
    ) -> Option<Vec<LockerId>> {
        if let Some(pos) = path.iter().position(|&node| node == current) {
            // Only the suffix from the first repeat is the cycle; the
            // prefix is the entry path leading into it.
            return Some(path[pos..].to_vec());
        }
        if !visited.insert(current) {
            return None;
        }
        path.push(current);
        if let Some(blockers) = self.edges.get(&current) {
            for &blocker in blockers {
                if let Some(cycle) = self.dfs(blocker, path, visited) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }

    /// Picks the cycle member to abort: lowest priority first, youngest
    /// (highest id) on ties. Returns `LockerId::INVALID` for an empty
    /// cycle.
    #[must_use]
    pub fn select_victim(&self, cycle: &[LockerId]) -> LockerId {
        cycle
            .iter()
            .copied()
            .min_by_key(|id| (self.priority_of(*id), Reverse(*id)))
            .unwrap_or(LockerId::INVALID)
    }

    fn priority_of(&self, locker: LockerId) -> i32 {
        self.priorities.get(&locker).copied().unwrap_or(0)
    }
}

/// Rotates a cycle so its smallest id comes first, giving every rotation
/// of the same cycle one canonical spelling.
fn normalize_cycle(cycle: &[LockerId]) -> Vec<LockerId> {
    let min_pos = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map_or(0, |(pos, _)| pos);
    let mut rotated = Vec::with_capacity(cycle.len());
    rotated.extend_from_slice(&cycle[min_pos..]);
    rotated.extend_from_slice(&cycle[..min_pos]);
    rotated
}

/// Sweeps the table once and aborts one victim per detected cycle.
/// Returns the number of victims aborted.
pub(crate) fn run_detection_pass(
    table: &LockTable,
    budget: &MemoryBudget,
    stats: &LockStats,
    listener: &dyn LockEventListener,
) -> usize {
    let snapshots = table.snapshot_waits();
    if snapshots.is_empty() {
        return 0;
    }

    let mut graph = WaitForGraph::new();
    for snap in &snapshots {
        graph.set_priority(snap.locker.id(), snap.locker.priority());
        for &blocker in &snap.blockers {
            graph.add_wait(snap.locker.id(), blocker);
        }
    }

    let mut aborted = 0;
    for info in graph.detect() {
        if abort_victim(table, budget, &snapshots, &info) {
            stats.record_deadlock();
            listener.on_deadlock(info.victim, &info.cycle);
            aborted += 1;
        }
    }
    aborted
}

/// Marks the victim's wait as a deadlock and removes its waiter entry,
/// both under the victim's shard latch. Returns false if the wait already
/// resolved, in which case the cycle was stale and nobody is aborted.
fn abort_victim(
    table: &LockTable,
    budget: &MemoryBudget,
    snapshots: &[WaitSnapshot],
    info: &DeadlockInfo,
) -> bool {
    let Some(snap) = snapshots.iter().find(|s| s.locker.id() == info.victim) else {
        return false;
    };

    {
        let mut locks = table.shard(snap.shard).locks.lock();
        if !snap.handle.try_deadlock(&info.cycle) {
            return false;
        }
        if let Some(lock) = locks.get_mut(&snap.resource) {
            let bucket = budget_bucket(budget, snap.shard);
            lock.flush_waiter(info.victim, budget, bucket);
            if lock.is_free() {
                budget.adjust(bucket, -lock.footprint());
                locks.remove(&snap.resource);
            }
        }
    }
    snap.handle.notify();
    info!(
        "deadlock: aborting locker {} waiting on LSN {}, cycle {:?}",
        info.victim, snap.resource, info.cycle
    );
    true
}

struct DetectorGate {
    armed: bool,
    shutdown: bool,
}

struct DetectorShared {
    gate: Mutex<DetectorGate>,
    wakeup: Condvar,
}

struct DetectorContext {
    table: Arc<LockTable>,
    budget: Arc<MemoryBudget>,
    stats: Arc<LockStats>,
    listener: Arc<RwLock<Arc<dyn LockEventListener>>>,
    delay: Duration,
}

/// Background detection thread. Joined on drop.
pub(crate) struct DeadlockDetector {
    shared: Arc<DetectorShared>,
    thread: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    pub(crate) fn spawn(
        table: Arc<LockTable>,
        budget: Arc<MemoryBudget>,
        stats: Arc<LockStats>,
        listener: Arc<RwLock<Arc<dyn LockEventListener>>>,
        delay: Duration,
    ) -> Self {
        let shared = Arc::new(DetectorShared {
            gate: Mutex::new(DetectorGate {
                armed: false,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let ctx = DetectorContext {
            table,
            budget,
            stats,
            listener,
            delay,
        };
        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || detector_loop(&thread_shared, &ctx));
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Schedules a pass. Called on every enqueue; arming an armed
    /// detector is free.
    pub(crate) fn arm(&self) {
        let mut gate = self.shared.gate.lock();
        if !gate.armed {
            gate.armed = true;
            self.shared.wakeup.notify_one();
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        {
            let mut gate = self.shared.gate.lock();
            gate.shutdown = true;
            self.shared.wakeup.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn detector_loop(shared: &DetectorShared, ctx: &DetectorContext) {
    loop {
        {
            let mut gate = shared.gate.lock();
            while !gate.armed && !gate.shutdown {
                shared.wakeup.wait(&mut gate);
            }
            if gate.shutdown {
                return;
            }
            gate.armed = false;
        }

        // Most waits resolve on their own; sweep only if the contention
        // outlives the delay. Shutdown still interrupts the sleep.
        let deadline = Instant::now() + ctx.delay;
        {
            let mut gate = shared.gate.lock();
            while !gate.shutdown {
                if shared.wakeup.wait_until(&mut gate, deadline).timed_out() {
                    break;
                }
            }
            if gate.shutdown {
                return;
            }
        }

        let callback = Arc::clone(&*ctx.listener.read());
        let aborted = run_detection_pass(&ctx.table, &ctx.budget, &ctx.stats, &*callback);
        if aborted > 0 {
            debug!("deadlock pass aborted {} waiters", aborted);
        }

        // Waiters that were parked before this pass began, or parked
        // during it, still deserve a sweep.
        if ctx.table.waiter_count() > 0 {
            shared.gate.lock().armed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use keel_common::types::Lsn;

    use crate::lock::{Lock, LockAttempt};
    use crate::locker::Locker;
    use crate::manager::NoopListener;
    use crate::types::LockType;
    use crate::wait::{ParkOutcome, WaitHandle};

    fn id(raw: u64) -> LockerId {
        LockerId::new(raw)
    }

    #[test]
    fn test_empty_graph() {
        let graph = WaitForGraph::new();
        assert!(graph.detect().is_empty());
        assert!(graph.find_cycle_from(id(1)).is_none());
    }

    #[test]
    fn test_chain_is_not_a_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(3));
        assert!(graph.detect().is_empty());
    }

    #[test]
    fn test_two_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(1));

        let found = graph.detect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cycle, vec![id(1), id(2)]);
        // Equal priority, so the youngest loses.
        assert_eq!(found[0].victim, id(2));
    }

    #[test]
    fn test_three_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(3));
        graph.add_wait(id(3), id(1));

        let found = graph.detect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cycle.len(), 3);
        assert_eq!(found[0].victim, id(3));
    }

    #[test]
    fn test_entry_path_is_not_part_of_the_cycle() {
        // 9 waits into the 1<->2 cycle but is not a member of it.
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(9), id(1));
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(1));

        let cycle = graph.find_cycle_from(id(9)).unwrap();
        assert_eq!(normalize_cycle(&cycle), vec![id(1), id(2)]);

        let found = graph.detect();
        assert_eq!(found.len(), 1);
        assert!(!found[0].cycle.contains(&id(9)));
    }

    #[test]
    fn test_victim_prefers_lowest_priority() {
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(1));
        graph.set_priority(id(1), 0);
        graph.set_priority(id(2), 5);

        // Locker 2 is younger but outranks 1.
        assert_eq!(graph.detect()[0].victim, id(1));
    }

    #[test]
    fn test_disjoint_cycles_each_get_a_victim() {
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(1));
        graph.add_wait(id(7), id(8));
        graph.add_wait(id(8), id(7));

        let found = graph.detect();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].victim, id(2));
        assert_eq!(found[1].victim, id(8));
    }

    #[test]
    fn test_same_cycle_reported_once() {
        let mut graph = WaitForGraph::new();
        graph.add_wait(id(1), id(2));
        graph.add_wait(id(2), id(3));
        graph.add_wait(id(3), id(1));
        // All three starts close the same loop.
        assert_eq!(graph.detect().len(), 1);
    }

    #[test]
    fn test_normalize_rotation() {
        let cycle = vec![id(5), id(2), id(9)];
        assert_eq!(normalize_cycle(&cycle), vec![id(2), id(9), id(5)]);
    }

    /// Builds the classic two-resource cross wait directly in a table and
    /// proves one pass aborts exactly the youngest waiter.
    #[test]
    fn test_detection_pass_aborts_victim() {
        let table = LockTable::new(4);
        let budget = MemoryBudget::new(1 << 20, 4);
        let stats = LockStats::default();

        let a = Arc::new(Locker::new(id(1), 0));
        let b = Arc::new(Locker::new(id(2), 0));
        let r1 = Lsn::new(101);
        let r2 = Lsn::new(102);

        let enqueue = |resource: Lsn, owner: &Arc<Locker>, waiter: &Arc<Locker>| {
            let shard = table.shard_index(resource);
            let mut locks = table.shard(shard).locks.lock();
            locks.insert(resource, Lock::thin(owner, LockType::Write));
            let entry = locks.get_mut(&resource).unwrap();
            match entry.lock(LockType::Write, waiter, false, false, &budget, shard) {
                LockAttempt::Enqueued(handle) => handle,
                _ => panic!("expected enqueue"),
            }
        };
        let handle_b = enqueue(r1, &a, &b);
        let handle_a = enqueue(r2, &b, &a);

        assert_eq!(run_detection_pass(&table, &budget, &stats, &NoopListener), 1);
        assert_eq!(stats.n_deadlocks.load(std::sync::atomic::Ordering::Relaxed), 1);

        // The younger locker lost; the survivor is still parked.
        match handle_b.park(Instant::now()) {
            ParkOutcome::Deadlock(cycle) => {
                assert!(cycle.contains(&a.id()) && cycle.contains(&b.id()));
            }
            other => panic!("victim should observe the deadlock, got {other:?}"),
        }
        assert!(handle_a.is_waiting());

        // The victim's waiter entry is gone from r1.
        let shard = table.shard_index(r1);
        let locks = table.shard(shard).locks.lock();
        assert_eq!(locks.get(&r1).map(Lock::n_waiters), Some(0));
    }

    #[test]
    fn test_detection_pass_skips_resolved_waits() {
        let table = LockTable::new(4);
        let budget = MemoryBudget::new(1 << 20, 4);
        let stats = LockStats::default();

        let a = Arc::new(Locker::new(id(1), 0));
        let b = Arc::new(Locker::new(id(2), 0));
        let r1 = Lsn::new(5);
        let shard = table.shard_index(r1);
        {
            let mut locks = table.shard(shard).locks.lock();
            locks.insert(r1, Lock::thin(&a, LockType::Write));
            let entry = locks.get_mut(&r1).unwrap();
            let attempt = entry.lock(LockType::Read, &b, false, false, &budget, shard);
            assert!(matches!(attempt, LockAttempt::Enqueued(_)));
        }

        // One blocked waiter, no cycle: nothing to abort.
        assert_eq!(run_detection_pass(&table, &budget, &stats, &NoopListener), 0);
        assert_eq!(stats.n_deadlocks.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn test_abort_victim_respects_late_grant() {
        // The snapshot says the waiter is blocked, but a grant lands
        // before the detector re-latches. The stale victim must survive.
        let table = LockTable::new(1);
        let budget = MemoryBudget::new(1 << 20, 1);

        let b = Arc::new(Locker::new(id(2), 0));
        let handle = WaitHandle::new();
        let snap = WaitSnapshot {
            resource: Lsn::new(1),
            shard: 0,
            locker: Arc::clone(&b),
            handle: Arc::clone(&handle),
            blockers: vec![id(1)],
        };
        handle.grant(crate::types::LockGrant::New);

        let info = DeadlockInfo {
            cycle: vec![id(1), id(2)],
            victim: id(2),
        };
        assert!(!abort_victim(&table, &budget, &[snap], &info));
    }
}
