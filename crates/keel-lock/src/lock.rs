//! Per-record lock state.
//!
//! A `Lock` is the value stored against one LSN in a lock-table shard. The
//! overwhelmingly common case is a single owner and no contention, so the
//! representation starts `Thin` (one inline owner entry) and converts to
//! `Multi` (owner list plus FIFO waiter queue) the first time a second
//! locker shows up. It never converts back; the entry is dropped entirely
//! once the last owner and waiter are gone.
//!
//! Every mutating method runs under the owning shard's latch and settles
//! its own memory accounting: the footprint is a pure function of the
//! representation, and each method charges the budget with the delta it
//! caused. Creation and destruction of the map entry are accounted by the
//! caller, since only the caller sees the map.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;

use keel_common::memory::MemoryBudget;
use keel_common::types::{LockerId, Lsn};

use crate::locker::Locker;
use crate::table::WaitSnapshot;
use crate::types::{LockGrant, LockType};
use crate::wait::WaitHandle;

/// Bytes charged for a lock-table map entry: key, inline enum payload, and
/// hash-bucket slack.
pub(crate) const LOCK_ENTRY_OVERHEAD: usize =
    mem::size_of::<Lsn>() + mem::size_of::<Lock>() + 16;

/// Bytes charged per owner entry once a lock has gone multi.
pub(crate) const OWNER_ENTRY_OVERHEAD: usize = mem::size_of::<LockInfo>();

/// Bytes charged per waiter entry: the queue slot plus its wait handle.
pub(crate) const WAITER_ENTRY_OVERHEAD: usize =
    mem::size_of::<Waiter>() + mem::size_of::<WaitHandle>();

/// One owner's hold on a lock.
#[derive(Clone)]
pub(crate) struct LockInfo {
    pub locker: Arc<Locker>,
    pub lock_type: LockType,
}

impl fmt::Debug for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.locker.id(), self.lock_type)
    }
}

/// A queued request.
pub(crate) struct Waiter {
    pub info: LockInfo,
    pub handle: Arc<WaitHandle>,
    /// True when `info.locker` already owns this lock and is waiting to
    /// replace its held type with the join of held and requested.
    pub upgrade: bool,
}

/// Outcome of one lock attempt, decided under the shard latch.
pub(crate) enum LockAttempt {
    Granted(LockGrant),
    Denied,
    Enqueued(Arc<WaitHandle>),
}

/// A waiter promoted during a release. The grant is already stored in the
/// handle; the caller notifies after dropping the shard latch.
pub(crate) struct Woken {
    pub locker_id: LockerId,
    pub handle: Arc<WaitHandle>,
}

/// Lock state for one record.
pub(crate) enum Lock {
    /// Exactly one owner, nobody queued.
    Thin(LockInfo),
    /// Owner list plus FIFO waiter queue.
    Multi(MultiLock),
}

pub(crate) struct MultiLock {
    pub owners: Vec<LockInfo>,
    pub waiters: VecDeque<Waiter>,
}

impl Lock {
    /// Creates a thin lock with its first owner. The caller charges the
    /// footprint when inserting into the map.
    pub(crate) fn thin(locker: &Arc<Locker>, lock_type: LockType) -> Self {
        Lock::Thin(LockInfo {
            locker: Arc::clone(locker),
            lock_type,
        })
    }

    /// Bytes this lock currently charges against the budget.
    pub(crate) fn footprint(&self) -> i64 {
        let bytes = match self {
            Lock::Thin(_) => LOCK_ENTRY_OVERHEAD,
            Lock::Multi(multi) => {
                LOCK_ENTRY_OVERHEAD
                    + multi.owners.len() * OWNER_ENTRY_OVERHEAD
                    + multi.waiters.len() * WAITER_ENTRY_OVERHEAD
            }
        };
        bytes as i64
    }

    /// Attempts to lock for `locker`.
    ///
    /// The four steps, in order: an existing owner is covered or upgraded;
    /// a newcomer compatible with every owner is admitted; a non-blocking
    /// request that conflicts is denied without touching state; everything
    /// else is enqueued. Upgrade waits and `jump_ahead` requests go to the
    /// head of the queue, normal requests to the tail.
    pub(crate) fn lock(
        &mut self,
        request: LockType,
        locker: &Arc<Locker>,
        non_blocking: bool,
        jump_ahead: bool,
        budget: &MemoryBudget,
        bucket: usize,
    ) -> LockAttempt {
        let before = self.footprint();
        let attempt = self.lock_inner(request, locker, non_blocking, jump_ahead);
        budget.adjust(bucket, self.footprint() - before);
        attempt
    }

    fn lock_inner(
        &mut self,
        request: LockType,
        locker: &Arc<Locker>,
        non_blocking: bool,
        jump_ahead: bool,
    ) -> LockAttempt {
        match self {
            Lock::Thin(info) => {
                if info.locker.id() == locker.id() {
                    if info.lock_type.covers(request) {
                        return LockAttempt::Granted(LockGrant::Existing);
                    }
                    // Sole owner: upgrade in place, still thin.
                    info.lock_type = info.lock_type.join(request);
                    return LockAttempt::Granted(LockGrant::Promotion);
                }
                if non_blocking && !request.is_compatible_with(&info.lock_type) {
                    return LockAttempt::Denied;
                }
                // A second party arrives: convert and retry in multi form.
                let mut multi = MultiLock {
                    owners: vec![info.clone()],
                    waiters: VecDeque::new(),
                };
                let attempt = multi.lock(request, locker, non_blocking, jump_ahead);
                *self = Lock::Multi(multi);
                attempt
            }
            Lock::Multi(multi) => multi.lock(request, locker, non_blocking, jump_ahead),
        }
    }

    /// Releases `locker`'s hold.
    ///
    /// Returns `None` if the locker held nothing here (safe no-op),
    /// otherwise the waiters promoted by the removal, possibly empty. The
    /// caller notifies them after dropping the shard latch and removes the
    /// whole entry if the lock is now free.
    pub(crate) fn release(
        &mut self,
        locker: LockerId,
        budget: &MemoryBudget,
        bucket: usize,
    ) -> Option<Vec<Woken>> {
        let before = self.footprint();
        let woken = self.release_inner(locker);
        budget.adjust(bucket, self.footprint() - before);
        woken
    }

    fn release_inner(&mut self, locker: LockerId) -> Option<Vec<Woken>> {
        match self {
            Lock::Thin(info) => {
                if info.locker.id() == locker {
                    *self = Lock::Multi(MultiLock {
                        owners: Vec::new(),
                        waiters: VecDeque::new(),
                    });
                    Some(Vec::new())
                } else {
                    None
                }
            }
            Lock::Multi(multi) => {
                if let Some(idx) = multi.owner_index(locker) {
                    multi.owners.remove(idx);
                    Some(multi.grant_waiters())
                } else if let Some(idx) = multi.waiter_index(locker) {
                    // A waiter unwinding through the normal release path,
                    // e.g. after its transaction was aborted elsewhere.
                    multi.waiters.remove(idx);
                    Some(multi.grant_waiters())
                } else {
                    None
                }
            }
        }
    }

    /// Forcibly removes every owner except `locker`, marking the removed
    /// owners preempted, and leaves `locker` the sole owner with at least
    /// `lock_type`. Waiters stay queued.
    pub(crate) fn steal(
        &mut self,
        locker: &Arc<Locker>,
        lock_type: LockType,
        budget: &MemoryBudget,
        bucket: usize,
    ) -> Vec<Arc<Locker>> {
        let before = self.footprint();
        let removed = self.steal_inner(locker, lock_type);
        budget.adjust(bucket, self.footprint() - before);
        removed
    }

    fn steal_inner(&mut self, locker: &Arc<Locker>, lock_type: LockType) -> Vec<Arc<Locker>> {
        match self {
            Lock::Thin(info) => {
                if info.locker.id() == locker.id() {
                    info.lock_type = info.lock_type.join(lock_type);
                    Vec::new()
                } else {
                    info.locker.mark_preempted();
                    let removed = vec![Arc::clone(&info.locker)];
                    *self = Lock::Thin(LockInfo {
                        locker: Arc::clone(locker),
                        lock_type,
                    });
                    removed
                }
            }
            Lock::Multi(multi) => {
                let mut removed = Vec::new();
                multi.owners.retain(|owner| {
                    if owner.locker.id() == locker.id() {
                        true
                    } else {
                        owner.locker.mark_preempted();
                        removed.push(Arc::clone(&owner.locker));
                        false
                    }
                });
                match multi.owner_index(locker.id()) {
                    Some(idx) => {
                        let held = multi.owners[idx].lock_type;
                        multi.owners[idx].lock_type = held.join(lock_type);
                    }
                    None => multi.owners.push(LockInfo {
                        locker: Arc::clone(locker),
                        lock_type,
                    }),
                }
                removed
            }
        }
    }

    /// Downgrades `locker`'s write-class hold to its shared form.
    ///
    /// Waiters are deliberately not re-evaluated; the next release picks
    /// them up. Errors are invariant violations on the caller's part.
    pub(crate) fn demote(&mut self, locker: LockerId) -> Result<(), String> {
        let info = match self {
            Lock::Thin(info) if info.locker.id() == locker => info,
            Lock::Multi(multi) => match multi.owner_index(locker) {
                Some(idx) => &mut multi.owners[idx],
                None => return Err(format!("demote: locker {locker} does not own this lock")),
            },
            Lock::Thin(_) => {
                return Err(format!("demote: locker {locker} does not own this lock"))
            }
        };
        if !info.lock_type.is_write_lock() {
            return Err(format!(
                "demote: locker {locker} holds non-write {}",
                info.lock_type
            ));
        }
        info.lock_type = info.lock_type.demoted();
        Ok(())
    }

    /// Removes `locker`'s waiter entry, if any. No promotion pass runs:
    /// owner state is unchanged, so grantability is settled at the next
    /// release.
    pub(crate) fn flush_waiter(
        &mut self,
        locker: LockerId,
        budget: &MemoryBudget,
        bucket: usize,
    ) -> bool {
        let before = self.footprint();
        let flushed = match self {
            Lock::Thin(_) => false,
            Lock::Multi(multi) => match multi.waiter_index(locker) {
                Some(idx) => {
                    multi.waiters.remove(idx);
                    true
                }
                None => false,
            },
        };
        budget.adjust(bucket, self.footprint() - before);
        flushed
    }

    /// True when no owner and no waiter remain; the caller removes the
    /// entry and credits the remaining footprint.
    pub(crate) fn is_free(&self) -> bool {
        match self {
            Lock::Thin(_) => false,
            Lock::Multi(multi) => multi.owners.is_empty() && multi.waiters.is_empty(),
        }
    }

    pub(crate) fn is_thin(&self) -> bool {
        matches!(self, Lock::Thin(_))
    }

    pub(crate) fn n_owners(&self) -> usize {
        match self {
            Lock::Thin(_) => 1,
            Lock::Multi(multi) => multi.owners.len(),
        }
    }

    pub(crate) fn n_waiters(&self) -> usize {
        match self {
            Lock::Thin(_) => 0,
            Lock::Multi(multi) => multi.waiters.len(),
        }
    }

    /// The type `locker` holds here, if it is an owner.
    pub(crate) fn owned_type(&self, locker: LockerId) -> Option<LockType> {
        match self {
            Lock::Thin(info) if info.locker.id() == locker => Some(info.lock_type),
            Lock::Thin(_) => None,
            Lock::Multi(multi) => multi
                .owner_index(locker)
                .map(|idx| multi.owners[idx].lock_type),
        }
    }

    /// True if `locker` owns this lock with a type covering `lock_type`.
    pub(crate) fn is_owner(&self, locker: LockerId, lock_type: LockType) -> bool {
        self.owned_type(locker)
            .is_some_and(|held| held.covers(lock_type))
    }

    pub(crate) fn is_waiter(&self, locker: LockerId) -> bool {
        match self {
            Lock::Thin(_) => false,
            Lock::Multi(multi) => multi.waiter_index(locker).is_some(),
        }
    }

    /// The owner holding a write-class lock, if any. The compatibility
    /// matrix guarantees at most one.
    pub(crate) fn write_owner(&self) -> Option<LockerId> {
        match self {
            Lock::Thin(info) => info.lock_type.is_write_lock().then(|| info.locker.id()),
            Lock::Multi(multi) => multi
                .owners
                .iter()
                .find(|owner| owner.lock_type.is_write_lock())
                .map(|owner| owner.locker.id()),
        }
    }

    /// Clones the owner list as `(locker, held type)` pairs.
    pub(crate) fn owners_snapshot(&self) -> Vec<(LockerId, LockType)> {
        match self {
            Lock::Thin(info) => vec![(info.locker.id(), info.lock_type)],
            Lock::Multi(multi) => multi
                .owners
                .iter()
                .map(|owner| (owner.locker.id(), owner.lock_type))
                .collect(),
        }
    }

    /// Clones the waiter queue, head first, as `(locker, requested type)`
    /// pairs. Upgrade waits report the requested delta, not the join.
    pub(crate) fn waiters_snapshot(&self) -> Vec<(LockerId, LockType)> {
        match self {
            Lock::Thin(_) => Vec::new(),
            Lock::Multi(multi) => multi
                .waiters
                .iter()
                .map(|waiter| (waiter.info.locker.id(), waiter.info.lock_type))
                .collect(),
        }
    }

    /// Appends one snapshot per blocked waiter, carrying the owners that
    /// conflict with it. Waiters blocked only by queue position produce no
    /// snapshot; they cannot be part of a cycle.
    pub(crate) fn collect_waits(&self, resource: Lsn, shard: usize, out: &mut Vec<WaitSnapshot>) {
        if let Lock::Multi(multi) = self {
            for waiter in &multi.waiters {
                let waiter_id = waiter.info.locker.id();
                let blockers: Vec<LockerId> = multi
                    .owners
                    .iter()
                    .filter(|owner| {
                        owner.locker.id() != waiter_id
                            && !waiter.info.lock_type.is_compatible_with(&owner.lock_type)
                    })
                    .map(|owner| owner.locker.id())
                    .collect();
                if !blockers.is_empty() {
                    out.push(WaitSnapshot {
                        resource,
                        shard,
                        locker: Arc::clone(&waiter.info.locker),
                        handle: Arc::clone(&waiter.handle),
                        blockers,
                    });
                }
            }
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lock::Thin(info) => write!(f, "thin owner={:?}", info),
            Lock::Multi(multi) => {
                write!(f, "owners=[")?;
                for (i, owner) in multi.owners.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", owner)?;
                }
                write!(f, "] waiters=[")?;
                for (i, waiter) in multi.waiters.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", waiter.info)?;
                    if waiter.upgrade {
                        write!(f, "^")?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}

impl MultiLock {
    fn owner_index(&self, locker: LockerId) -> Option<usize> {
        self.owners.iter().position(|o| o.locker.id() == locker)
    }

    fn waiter_index(&self, locker: LockerId) -> Option<usize> {
        self.waiters
            .iter()
            .position(|w| w.info.locker.id() == locker)
    }

    /// True if `lock_type` is compatible with every owner except the one
    /// at `skip` (the requester's own entry during an upgrade check).
    fn compatible_with_owners(&self, lock_type: LockType, skip: Option<usize>) -> bool {
        self.owners
            .iter()
            .enumerate()
            .all(|(i, owner)| Some(i) == skip || lock_type.is_compatible_with(&owner.lock_type))
    }

    fn lock(
        &mut self,
        request: LockType,
        locker: &Arc<Locker>,
        non_blocking: bool,
        jump_ahead: bool,
    ) -> LockAttempt {
        // Step 1: existing owner. Covered requests return as-is; otherwise
        // try to upgrade to the join of held and requested.
        if let Some(idx) = self.owner_index(locker.id()) {
            let held = self.owners[idx].lock_type;
            if held.covers(request) {
                return LockAttempt::Granted(LockGrant::Existing);
            }
            let target = held.join(request);
            if self.compatible_with_owners(target, Some(idx)) {
                self.owners[idx].lock_type = target;
                return LockAttempt::Granted(LockGrant::Promotion);
            }
            if non_blocking {
                return LockAttempt::Denied;
            }
            // Upgrade waits park at the head so the delta is considered
            // before any newcomer.
            let handle = WaitHandle::new();
            self.waiters.push_front(Waiter {
                info: LockInfo {
                    locker: Arc::clone(locker),
                    lock_type: request,
                },
                handle: Arc::clone(&handle),
                upgrade: true,
            });
            return LockAttempt::Enqueued(handle);
        }

        // Step 2: newcomer admission is judged against owners only, never
        // against the queue.
        if self.compatible_with_owners(request, None) {
            self.owners.push(LockInfo {
                locker: Arc::clone(locker),
                lock_type: request,
            });
            return LockAttempt::Granted(LockGrant::New);
        }

        // Step 3: non-blocking requests never queue.
        if non_blocking {
            return LockAttempt::Denied;
        }

        // Step 4: enqueue.
        let handle = WaitHandle::new();
        let waiter = Waiter {
            info: LockInfo {
                locker: Arc::clone(locker),
                lock_type: request,
            },
            handle: Arc::clone(&handle),
            upgrade: false,
        };
        if jump_ahead {
            self.waiters.push_front(waiter);
        } else {
            self.waiters.push_back(waiter);
        }
        LockAttempt::Enqueued(handle)
    }

    /// Promotes the longest grantable prefix of the queue, front to back,
    /// stopping at the first waiter that cannot be admitted. Grants are
    /// stored in the handles here, under the latch; the returned list is
    /// notified by the caller after unlatching.
    fn grant_waiters(&mut self) -> Vec<Woken> {
        let mut woken = Vec::new();
        while let Some(waiter) = self.waiters.pop_front() {
            let locker_id = waiter.info.locker.id();
            let request = waiter.info.lock_type;
            let owner_idx = if waiter.upgrade {
                self.owner_index(locker_id)
            } else {
                None
            };

            let grantable = match owner_idx {
                Some(idx) => {
                    let target = self.owners[idx].lock_type.join(request);
                    self.compatible_with_owners(target, Some(idx))
                }
                None => self.compatible_with_owners(request, None),
            };
            if !grantable {
                // Strict FIFO: the first blocked waiter ends the pass.
                self.waiters.push_front(waiter);
                break;
            }

            match owner_idx {
                Some(idx) => {
                    let held = self.owners[idx].lock_type;
                    self.owners[idx].lock_type = held.join(request);
                    waiter.handle.grant(LockGrant::Promotion);
                }
                None => {
                    self.owners.push(waiter.info.clone());
                    waiter.handle.grant(LockGrant::New);
                }
            }
            woken.push(Woken {
                locker_id,
                handle: waiter.handle,
            });
        }
        woken
    }
}
