//! Lock-holding agents.
//!
//! A `Locker` stands for one transaction (or one engine-internal task) in
//! the lock table. It issues lock requests from a single thread, so at most
//! one of its requests can be blocked at a time. Its flags are still shared
//! state: the deadlock detector and lock stealers flip them from other
//! threads while the locker's own thread is running or parked.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use keel_common::types::{LockerId, Lsn};

/// One lock-holding agent.
///
/// Created by [`LockManager::begin_locker`](crate::LockManager::begin_locker)
/// and shared via `Arc` between the owning thread and the lock table's
/// owner/waiter entries.
pub struct Locker {
    id: LockerId,
    /// Deadlock victim preference. Lower loses; ties go to the youngest.
    priority: i32,
    /// Set when another locker steals a lock out from under this one. A
    /// preempted locker's next lock request fails with
    /// [`LockError::Preempted`](crate::LockError::Preempted).
    preempted: AtomicBool,
    /// Set once `end_locker` has run; further lock requests are refused.
    ended: AtomicBool,
    /// Resources this locker currently owns, maintained by the manager.
    owned: Mutex<HashSet<Lsn>>,
}

impl Locker {
    pub(crate) fn new(id: LockerId, priority: i32) -> Self {
        Self {
            id,
            priority,
            preempted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            owned: Mutex::new(HashSet::new()),
        }
    }

    /// Returns this locker's id.
    #[inline]
    pub fn id(&self) -> LockerId {
        self.id
    }

    /// Returns the deadlock victim priority.
    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns true if a steal revoked one of this locker's locks.
    pub fn is_preempted(&self) -> bool {
        self.preempted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_preempted(&self) {
        self.preempted.store(true, Ordering::Release);
    }

    /// Returns true if this locker has ended.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    /// Returns how many locks this locker currently owns.
    pub fn owned_count(&self) -> usize {
        self.owned.lock().len()
    }

    /// Returns true if this locker owns a lock on `resource`.
    pub fn owns(&self, resource: Lsn) -> bool {
        self.owned.lock().contains(&resource)
    }

    pub(crate) fn add_owned(&self, resource: Lsn) {
        self.owned.lock().insert(resource);
    }

    pub(crate) fn remove_owned(&self, resource: Lsn) {
        self.owned.lock().remove(&resource);
    }

    /// Drains and returns the owned set, leaving it empty.
    pub(crate) fn take_owned(&self) -> Vec<Lsn> {
        self.owned.lock().drain().collect()
    }
}

impl fmt::Debug for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("preempted", &self.is_preempted())
            .field("ended", &self.is_ended())
            .field("owned", &self.owned_count())
            .finish()
    }
}

impl fmt::Display for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locker({}, prio={})", self.id, self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_locker() {
        let locker = Locker::new(LockerId::new(1), 5);
        assert_eq!(locker.id(), LockerId::new(1));
        assert_eq!(locker.priority(), 5);
        assert!(!locker.is_preempted());
        assert!(!locker.is_ended());
        assert_eq!(locker.owned_count(), 0);
    }

    #[test]
    fn test_flags_stick() {
        let locker = Locker::new(LockerId::new(2), 0);
        locker.mark_preempted();
        locker.mark_ended();
        assert!(locker.is_preempted());
        assert!(locker.is_ended());
    }

    #[test]
    fn test_owned_set() {
        let locker = Locker::new(LockerId::new(3), 0);
        locker.add_owned(Lsn::new(10));
        locker.add_owned(Lsn::new(20));
        locker.add_owned(Lsn::new(10)); // idempotent
        assert_eq!(locker.owned_count(), 2);
        assert!(locker.owns(Lsn::new(10)));

        locker.remove_owned(Lsn::new(10));
        assert!(!locker.owns(Lsn::new(10)));

        let mut drained = locker.take_owned();
        drained.sort_unstable();
        assert_eq!(drained, vec![Lsn::new(20)]);
        assert_eq!(locker.owned_count(), 0);
    }

    #[test]
    fn test_display() {
        let locker = Locker::new(LockerId::new(4), -1);
        assert_eq!(locker.to_string(), "Locker(4, prio=-1)");
    }
}
