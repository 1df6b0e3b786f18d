//! The lock manager facade.
//!
//! `LockManager` owns the sharded lock table, allocates locker identities,
//! runs the background deadlock detector, and charges every byte of lock
//! state to a memory budget. All blocking, waking, and abort decisions
//! funnel through here; the table and per-lock state machines below it
//! never block.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use keel_common::constants::DEFAULT_CACHE_BUDGET_BYTES;
use keel_common::memory::MemoryBudget;
use keel_common::types::{LockerId, Lsn};

use crate::config::LockConfig;
use crate::deadlock::{run_detection_pass, DeadlockDetector};
use crate::error::{LockError, LockResult};
use crate::lock::{Lock, LockAttempt};
use crate::locker::Locker;
use crate::table::{budget_bucket, LockTable};
use crate::types::{LockGrant, LockType};
use crate::wait::{AbandonOutcome, ParkOutcome, WaitHandle};

/// Callbacks for lock lifecycle events.
///
/// All methods have empty default bodies, so implementors override only
/// what they observe. Callbacks run on the thread that caused the event,
/// after the shard latch is dropped; they must not call back into the
/// lock manager for the same resource.
pub trait LockEventListener: Send + Sync {
    /// A request could not be granted immediately and is about to park.
    fn on_lock_wait(&self, _locker: LockerId, _resource: Lsn, _lock_type: LockType) {}

    /// A waiter was chosen as deadlock victim.
    fn on_deadlock(&self, _victim: LockerId, _cycle: &[LockerId]) {}

    /// An owner lost its lock to a steal.
    fn on_preempted(&self, _locker: LockerId, _resource: Lsn) {}

    /// A waiter gave up after its deadline passed.
    fn on_timeout(&self, _locker: LockerId, _resource: Lsn) {}
}

/// Listener that ignores every event. Installed by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl LockEventListener for NoopListener {}

/// Lock manager counters. All relaxed; read with `load(Ordering::Relaxed)`.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock requests, blocking and non-blocking.
    pub n_requests: AtomicU64,
    /// Requests satisfied without parking.
    pub n_immediate: AtomicU64,
    /// Requests that parked at least once.
    pub n_waits: AtomicU64,
    /// Held types upgraded in place, immediately or after a wait.
    pub n_upgrades: AtomicU64,
    /// Waits that ended in a timeout error.
    pub n_timeouts: AtomicU64,
    /// Waits aborted as deadlock victims.
    pub n_deadlocks: AtomicU64,
    /// Steal operations.
    pub n_steals: AtomicU64,
    /// Release operations that removed an owner or waiter entry.
    pub n_releases: AtomicU64,
}

impl LockStats {
    pub(crate) fn record_request(&self) {
        self.n_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_immediate(&self) {
        self.n_immediate.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait(&self) {
        self.n_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upgrade(&self) {
        self.n_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.n_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock(&self) {
        self.n_deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.n_steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self) {
        self.n_releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of requests that had to park.
    #[must_use]
    pub fn wait_ratio(&self) -> f64 {
        let requests = self.n_requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.n_waits.load(Ordering::Relaxed) as f64 / requests as f64
    }
}

/// The lock manager.
///
/// Thread-safe; one instance serves the whole engine. Lockers are
/// single-threaded agents: each locker's requests must come from one
/// thread at a time, but any number of lockers run concurrently.
pub struct LockManager {
    config: LockConfig,
    table: Arc<LockTable>,
    budget: Arc<MemoryBudget>,
    lockers: Mutex<HashMap<LockerId, Arc<Locker>>>,
    next_locker: AtomicU64,
    stats: Arc<LockStats>,
    listener: Arc<RwLock<Arc<dyn LockEventListener>>>,
    detector: Option<DeadlockDetector>,
}

impl LockManager {
    /// Creates a lock manager charging lock state against `budget`.
    ///
    /// Footprints are charged to budget bucket `shard % n_buckets`, so a
    /// budget with one bucket per shard gives per-shard attribution.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn new(config: LockConfig, budget: Arc<MemoryBudget>) -> LockResult<Self> {
        config.validate().map_err(LockError::internal)?;
        let table = Arc::new(LockTable::new(config.n_shards));
        let stats = Arc::new(LockStats::default());
        let listener: Arc<RwLock<Arc<dyn LockEventListener>>> =
            Arc::new(RwLock::new(Arc::new(NoopListener)));
        let detector = config.deadlock_detection.then(|| {
            DeadlockDetector::spawn(
                Arc::clone(&table),
                Arc::clone(&budget),
                Arc::clone(&stats),
                Arc::clone(&listener),
                config.deadlock_detect_delay,
            )
        });
        Ok(Self {
            config,
            table,
            budget,
            lockers: Mutex::new(HashMap::new()),
            next_locker: AtomicU64::new(LockerId::MIN.as_u64()),
            stats,
            listener,
            detector,
        })
    }

    /// Creates a lock manager with its own budget.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn with_config(config: LockConfig) -> LockResult<Self> {
        let n_buckets = config.n_shards.max(1);
        let budget = Arc::new(MemoryBudget::new(DEFAULT_CACHE_BUDGET_BYTES, n_buckets));
        Self::new(config, budget)
    }

    /// Registers a new locker with default priority and returns its id.
    pub fn begin_locker(&self) -> LockerId {
        self.begin_locker_with_priority(0)
    }

    /// Registers a new locker. Lower priority lockers are preferred as
    /// deadlock victims.
    pub fn begin_locker_with_priority(&self, priority: i32) -> LockerId {
        let id = LockerId::new(self.next_locker.fetch_add(1, Ordering::Relaxed));
        let locker = Arc::new(Locker::new(id, priority));
        self.lockers.lock().insert(id, locker);
        trace!("began locker {} (priority {})", id, priority);
        id
    }

    /// Ends a locker: releases everything it holds and forgets it.
    /// Returns the number of lock entries released. Unknown lockers are
    /// a no-op, so ending twice is safe.
    pub fn end_locker(&self, locker: LockerId) -> usize {
        let handle = self.lockers.lock().remove(&locker);
        match handle {
            Some(handle) => {
                handle.mark_ended();
                let released = self.release_all_for(&handle);
                trace!("ended locker {} ({} locks released)", locker, released);
                released
            }
            None => 0,
        }
    }

    /// Acquires `lock_type` on `resource`, blocking until granted or the
    /// timeout expires. `timeout` of `None` uses the configured default.
    ///
    /// Outside serializable mode the range component of the request is
    /// dropped first; a degraded RANGE_INSERT becomes `NotNeeded` and
    /// takes no lock at all.
    ///
    /// # Errors
    ///
    /// `Timeout` if the deadline passes while queued, `Deadlock` if chosen
    /// as a victim, `Preempted` if this locker previously lost a lock to a
    /// steal, `LockerShutdown` if the locker was never begun or already
    /// ended.
    pub fn lock(
        &self,
        locker: LockerId,
        resource: Lsn,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockResult<LockGrant> {
        self.lock_internal(locker, resource, lock_type, timeout, false, false)
    }

    /// Attempts to acquire without blocking. A request that would have
    /// queued returns `Ok(LockGrant::Denied)` and leaves no trace.
    ///
    /// # Errors
    ///
    /// Same as [`lock`](Self::lock), minus `Timeout`.
    pub fn try_lock(
        &self,
        locker: LockerId,
        resource: Lsn,
        lock_type: LockType,
    ) -> LockResult<LockGrant> {
        self.lock_internal(locker, resource, lock_type, None, true, false)
    }

    /// Like [`lock`](Self::lock), but a request that must queue goes to
    /// the head of the waiter queue instead of the tail.
    ///
    /// Reserved for engine-internal callers that already hold a
    /// conflicting position, such as an evictor re-acquiring under a
    /// record it has pinned; ordinary transactions must not jump the
    /// queue.
    ///
    /// # Errors
    ///
    /// Same as [`lock`](Self::lock).
    pub fn lock_jump_ahead(
        &self,
        locker: LockerId,
        resource: Lsn,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockResult<LockGrant> {
        self.lock_internal(locker, resource, lock_type, timeout, false, true)
    }

    fn lock_internal(
        &self,
        locker_id: LockerId,
        resource: Lsn,
        lock_type: LockType,
        timeout: Option<Duration>,
        non_blocking: bool,
        jump_ahead: bool,
    ) -> LockResult<LockGrant> {
        self.stats.record_request();
        let locker = self.locker_handle(locker_id)?;
        if locker.is_preempted() {
            return Err(LockError::preempted(locker_id, resource));
        }

        let request = if self.config.serializable {
            lock_type
        } else {
            lock_type.without_range()
        };
        if request == LockType::None {
            self.stats.record_immediate();
            return Ok(LockGrant::NotNeeded);
        }

        let shard = self.table.shard_index(resource);
        let bucket = budget_bucket(&self.budget, shard);
        let attempt = {
            let mut locks = self.table.shard(shard).locks.lock();
            match locks.entry(resource) {
                Entry::Occupied(mut entry) => entry.get_mut().lock(
                    request,
                    &locker,
                    non_blocking,
                    jump_ahead,
                    &self.budget,
                    bucket,
                ),
                Entry::Vacant(vacant) => {
                    let lock = Lock::thin(&locker, request);
                    self.budget.adjust(bucket, lock.footprint());
                    vacant.insert(lock);
                    LockAttempt::Granted(LockGrant::New)
                }
            }
        };

        match attempt {
            LockAttempt::Granted(grant) => {
                self.note_grant(&locker, resource, grant);
                self.stats.record_immediate();
                Ok(grant)
            }
            LockAttempt::Denied => Ok(LockGrant::Denied),
            LockAttempt::Enqueued(handle) => {
                self.wait_for_grant(&locker, resource, request, shard, &handle, timeout)
            }
        }
    }

    /// Parks on `handle` until granted, aborted, or timed out. The waiter
    /// entry is already queued; every exit path below leaves the table
    /// without it.
    fn wait_for_grant(
        &self,
        locker: &Arc<Locker>,
        resource: Lsn,
        request: LockType,
        shard: usize,
        handle: &Arc<WaitHandle>,
        timeout: Option<Duration>,
    ) -> LockResult<LockGrant> {
        self.stats.record_wait();
        self.table.add_waiter();
        self.listener().on_lock_wait(locker.id(), resource, request);
        if let Some(detector) = &self.detector {
            detector.arm();
        }

        let wait_timeout = timeout.unwrap_or(self.config.lock_timeout);
        debug!(
            "locker {} waiting for {} on LSN {} (timeout {:?})",
            locker.id(),
            request,
            resource,
            wait_timeout
        );
        let outcome = handle.park(Instant::now() + wait_timeout);
        self.table.remove_waiter();

        match outcome {
            ParkOutcome::Granted(grant) => {
                self.note_grant(locker, resource, grant);
                Ok(grant)
            }
            ParkOutcome::Deadlock(cycle) => {
                debug!(
                    "locker {} aborted as deadlock victim on LSN {}",
                    locker.id(),
                    resource
                );
                Err(LockError::deadlock(locker.id(), cycle))
            }
            ParkOutcome::TimedOut => {
                self.finish_timeout(locker, resource, request, shard, handle, wait_timeout)
            }
        }
    }

    /// Settles the race between the deadline and a late grant or deadlock
    /// verdict, under the shard latch. Only a true abandonment removes the
    /// waiter entry; a grant that slipped in wins.
    fn finish_timeout(
        &self,
        locker: &Arc<Locker>,
        resource: Lsn,
        request: LockType,
        shard: usize,
        handle: &Arc<WaitHandle>,
        waited: Duration,
    ) -> LockResult<LockGrant> {
        let bucket = budget_bucket(&self.budget, shard);
        let (outcome, n_owners, n_waiters) = {
            let mut locks = self.table.shard(shard).locks.lock();
            let outcome = handle.try_abandon();
            if matches!(outcome, AbandonOutcome::Abandoned) {
                if let Some(lock) = locks.get_mut(&resource) {
                    lock.flush_waiter(locker.id(), &self.budget, bucket);
                    if lock.is_free() {
                        self.budget.adjust(bucket, -lock.footprint());
                        locks.remove(&resource);
                    }
                }
            }
            let (n_owners, n_waiters) = locks
                .get(&resource)
                .map_or((0, 0), |lock| (lock.n_owners(), lock.n_waiters()));
            (outcome, n_owners, n_waiters)
        };

        match outcome {
            AbandonOutcome::Abandoned => {
                self.stats.record_timeout();
                self.listener().on_timeout(locker.id(), resource);
                debug!(
                    "locker {} timed out after {:?} waiting for {} on LSN {}",
                    locker.id(),
                    waited,
                    request,
                    resource
                );
                Err(LockError::timeout(
                    locker.id(),
                    resource,
                    request,
                    waited,
                    n_owners,
                    n_waiters,
                ))
            }
            AbandonOutcome::Granted(grant) => {
                self.note_grant(locker, resource, grant);
                Ok(grant)
            }
            AbandonOutcome::Deadlock(cycle) => Err(LockError::deadlock(locker.id(), cycle)),
        }
    }

    fn note_grant(&self, locker: &Arc<Locker>, resource: Lsn, grant: LockGrant) {
        match grant {
            LockGrant::New => locker.add_owned(resource),
            LockGrant::Promotion => self.stats.record_upgrade(),
            _ => {}
        }
    }

    /// Releases `locker`'s hold on `resource`, owner or queued.
    ///
    /// Returns true if an entry was removed. Releasing something not held
    /// is a no-op returning false, which makes release idempotent and
    /// lets preempted lockers unwind blindly.
    pub fn release(&self, locker: LockerId, resource: Lsn) -> bool {
        if let Some(handle) = self.lockers.lock().get(&locker).cloned() {
            handle.remove_owned(resource);
        }
        self.release_entry(locker, resource)
    }

    /// Releases everything `locker` holds. Returns the number of entries
    /// released.
    pub fn release_all(&self, locker: LockerId) -> usize {
        let handle = self.lockers.lock().get(&locker).cloned();
        match handle {
            Some(handle) => self.release_all_for(&handle),
            None => 0,
        }
    }

    fn release_all_for(&self, locker: &Arc<Locker>) -> usize {
        let mut released = 0;
        for resource in locker.take_owned() {
            if self.release_entry(locker.id(), resource) {
                released += 1;
            }
        }
        released
    }

    fn release_entry(&self, locker: LockerId, resource: Lsn) -> bool {
        let shard = self.table.shard_index(resource);
        let bucket = budget_bucket(&self.budget, shard);
        let woken = {
            let mut locks = self.table.shard(shard).locks.lock();
            let Some(lock) = locks.get_mut(&resource) else {
                return false;
            };
            let Some(woken) = lock.release(locker, &self.budget, bucket) else {
                return false;
            };
            if lock.is_free() {
                self.budget.adjust(bucket, -lock.footprint());
                locks.remove(&resource);
            }
            woken
        };

        self.stats.record_release();
        for woken in woken {
            trace!(
                "release of LSN {} by locker {} wakes locker {}",
                resource,
                locker,
                woken.locker_id
            );
            woken.handle.notify();
        }
        true
    }

    /// Downgrades `locker`'s write-class hold on `resource` to its shared
    /// form. Waiters are not re-evaluated until the next release.
    ///
    /// # Errors
    ///
    /// `Internal` if the locker does not own the lock or holds a non-write
    /// type; both indicate a caller bug.
    pub fn demote(&self, locker: LockerId, resource: Lsn) -> LockResult<()> {
        let shard = self.table.shard_index(resource);
        let result = {
            let mut locks = self.table.shard(shard).locks.lock();
            match locks.get_mut(&resource) {
                Some(lock) => lock.demote(locker),
                None => Err(format!("demote: no lock at LSN {resource}")),
            }
        };
        result.map_err(|reason| {
            error!("{}", reason);
            LockError::internal(reason)
        })
    }

    /// Takes `lock_type` on `resource` for `locker` unconditionally,
    /// preempting every other owner. Returns the preempted locker ids.
    ///
    /// Preempted lockers keep running until their next [`lock`](Self::lock)
    /// call, which fails with `Preempted`; their releases of the stolen
    /// resource become no-ops. Waiters stay queued behind the new owner.
    /// Recovery and replay are the intended callers.
    ///
    /// # Errors
    ///
    /// `LockerShutdown` if `locker` was never begun or already ended.
    pub fn steal_lock(
        &self,
        locker: LockerId,
        resource: Lsn,
        lock_type: LockType,
    ) -> LockResult<Vec<LockerId>> {
        let handle = self.locker_handle(locker)?;
        let request = if self.config.serializable {
            lock_type
        } else {
            lock_type.without_range()
        };
        if request == LockType::None {
            return Ok(Vec::new());
        }

        let shard = self.table.shard_index(resource);
        let bucket = budget_bucket(&self.budget, shard);
        let removed = {
            let mut locks = self.table.shard(shard).locks.lock();
            match locks.entry(resource) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().steal(&handle, request, &self.budget, bucket)
                }
                Entry::Vacant(vacant) => {
                    let lock = Lock::thin(&handle, request);
                    self.budget.adjust(bucket, lock.footprint());
                    vacant.insert(lock);
                    Vec::new()
                }
            }
        };

        handle.add_owned(resource);
        self.stats.record_steal();
        let listener = self.listener();
        for victim in &removed {
            warn!(
                "locker {} stole {} on LSN {} from locker {}",
                locker,
                request,
                resource,
                victim.id()
            );
            listener.on_preempted(victim.id(), resource);
        }
        Ok(removed.iter().map(|victim| victim.id()).collect())
    }

    /// Runs one deadlock detection pass on the calling thread and returns
    /// the number of victims aborted. The background detector does the
    /// same thing on its own schedule; this entry point exists for
    /// deployments that disable it and sweep explicitly.
    pub fn run_deadlock_pass(&self) -> usize {
        run_detection_pass(&self.table, &self.budget, &self.stats, &*self.listener())
    }

    /// Replaces the event listener.
    pub fn set_listener(&self, listener: Arc<dyn LockEventListener>) {
        *self.listener.write() = listener;
    }

    fn listener(&self) -> Arc<dyn LockEventListener> {
        Arc::clone(&*self.listener.read())
    }

    fn locker_handle(&self, locker: LockerId) -> LockResult<Arc<Locker>> {
        self.lockers
            .lock()
            .get(&locker)
            .cloned()
            .ok_or(LockError::LockerShutdown { locker })
    }

    /// Number of owners on `resource`, zero if unlocked.
    #[must_use]
    pub fn n_owners(&self, resource: Lsn) -> usize {
        self.with_lock(resource, Lock::n_owners).unwrap_or(0)
    }

    /// Number of queued waiters on `resource`.
    #[must_use]
    pub fn n_waiters(&self, resource: Lsn) -> usize {
        self.with_lock(resource, Lock::n_waiters).unwrap_or(0)
    }

    /// True if `locker` owns `resource` with a type covering `lock_type`.
    #[must_use]
    pub fn is_owner(&self, locker: LockerId, resource: Lsn, lock_type: LockType) -> bool {
        self.with_lock(resource, |lock| lock.is_owner(locker, lock_type))
            .unwrap_or(false)
    }

    /// True if `locker` is queued on `resource`.
    #[must_use]
    pub fn is_waiter(&self, locker: LockerId, resource: Lsn) -> bool {
        self.with_lock(resource, |lock| lock.is_waiter(locker))
            .unwrap_or(false)
    }

    /// The type `locker` holds on `resource`, if it is an owner.
    #[must_use]
    pub fn owned_type(&self, locker: LockerId, resource: Lsn) -> Option<LockType> {
        self.with_lock(resource, |lock| lock.owned_type(locker))
            .flatten()
    }

    /// The owner holding a write-class lock on `resource`, if any.
    #[must_use]
    pub fn write_owner(&self, resource: Lsn) -> Option<LockerId> {
        self.with_lock(resource, Lock::write_owner).flatten()
    }

    /// True if `resource` is held in the uncontended single-owner
    /// representation.
    #[must_use]
    pub fn is_thin(&self, resource: Lsn) -> bool {
        self.with_lock(resource, Lock::is_thin).unwrap_or(false)
    }

    /// Clones the owner list of `resource` as `(locker, held type)` pairs,
    /// empty if unlocked. A diagnostic snapshot; stale once the latch drops.
    #[must_use]
    pub fn owners(&self, resource: Lsn) -> Vec<(LockerId, LockType)> {
        self.with_lock(resource, Lock::owners_snapshot)
            .unwrap_or_default()
    }

    /// Clones the waiter queue of `resource`, head first, as
    /// `(locker, requested type)` pairs.
    #[must_use]
    pub fn waiters(&self, resource: Lsn) -> Vec<(LockerId, LockType)> {
        self.with_lock(resource, Lock::waiters_snapshot)
            .unwrap_or_default()
    }

    fn with_lock<T>(&self, resource: Lsn, f: impl FnOnce(&Lock) -> T) -> Option<T> {
        let shard = self.table.shard_index(resource);
        let locks = self.table.shard(shard).locks.lock();
        locks.get(&resource).map(f)
    }

    /// Number of live lock entries across all shards.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.table.lock_count()
    }

    /// Number of threads currently parked or about to park.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.table.waiter_count()
    }

    /// Number of registered lockers.
    #[must_use]
    pub fn n_lockers(&self) -> usize {
        self.lockers.lock().len()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// The budget lock state is charged against.
    #[must_use]
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Renders every lock entry, sorted by resource, for diagnostics.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut entries: Vec<(Lsn, String)> = Vec::new();
        for idx in 0..self.table.n_shards() {
            let locks = self.table.shard(idx).locks.lock();
            for (resource, lock) in locks.iter() {
                entries.push((*resource, lock.to_string()));
            }
        }
        entries.sort_by_key(|entry| entry.0);

        let mut out = String::new();
        for (resource, lock) in entries {
            let _ = writeln!(out, "LSN {resource}: {lock}");
        }
        out
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("n_shards", &self.config.n_shards)
            .field("n_lockers", &self.n_lockers())
            .field("lock_count", &self.lock_count())
            .field("waiter_count", &self.waiter_count())
            .field("detector", &self.detector.is_some())
            .finish()
    }
}
