//! Parking for blocked lock requests.
//!
//! Each enqueued request gets a fresh `WaitHandle`. Its state leaves
//! `Waiting` exactly once, and always while the owning shard latch is held:
//! a releaser promotes the waiter and stores the grant, the deadlock
//! detector stores the cycle, or the timed-out waiter itself re-latches the
//! shard and abandons. The condvar notification is sent after the latch is
//! dropped; a parked thread that wakes for any reason re-reads the state
//! under the handle's own mutex, so late or missing notifications cost
//! latency, never correctness.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use keel_common::types::LockerId;

use crate::types::LockGrant;

/// What a parked thread observes when its wait ends.
#[derive(Debug)]
pub(crate) enum ParkOutcome {
    /// Promoted by a releaser; the lock is held.
    Granted(LockGrant),
    /// Chosen as a deadlock victim; the waiter entry is already gone.
    Deadlock(Vec<LockerId>),
    /// The deadline passed with the request still queued. The caller must
    /// re-latch the shard and call `try_abandon` to settle the race.
    TimedOut,
}

/// Resolution of the timeout race, decided under the shard latch.
#[derive(Debug)]
pub(crate) enum AbandonOutcome {
    /// The request was still queued; the caller removes the waiter entry.
    Abandoned,
    /// A grant slipped in before the latch was re-taken; the grant wins.
    Granted(LockGrant),
    /// The detector got there first; the waiter entry is already gone.
    Deadlock(Vec<LockerId>),
}

enum WaitState {
    Waiting,
    Granted(LockGrant),
    Deadlock(Vec<LockerId>),
    Abandoned,
}

/// One blocked request's rendezvous point.
pub(crate) struct WaitHandle {
    state: Mutex<WaitState>,
    wakeup: Condvar,
}

impl WaitHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaitState::Waiting),
            wakeup: Condvar::new(),
        })
    }

    /// Blocks until the state leaves `Waiting` or the deadline passes.
    pub(crate) fn park(&self, deadline: Instant) -> ParkOutcome {
        let mut state = self.state.lock();
        loop {
            match &*state {
                WaitState::Waiting => {
                    if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                        // A transition may have landed between the deadline
                        // and re-acquiring the state mutex.
                        return match &*state {
                            WaitState::Granted(grant) => ParkOutcome::Granted(*grant),
                            WaitState::Deadlock(cycle) => ParkOutcome::Deadlock(cycle.clone()),
                            _ => ParkOutcome::TimedOut,
                        };
                    }
                }
                WaitState::Granted(grant) => return ParkOutcome::Granted(*grant),
                WaitState::Deadlock(cycle) => return ParkOutcome::Deadlock(cycle.clone()),
                WaitState::Abandoned => return ParkOutcome::TimedOut,
            }
        }
    }

    /// Records a grant. Caller holds the shard latch and has already moved
    /// the waiter entry to the owners.
    pub(crate) fn grant(&self, grant: LockGrant) {
        let mut state = self.state.lock();
        debug_assert!(matches!(*state, WaitState::Waiting));
        *state = WaitState::Granted(grant);
    }

    /// Marks the waiter a deadlock victim if it is still waiting. Caller
    /// holds the shard latch and removes the waiter entry on `true`.
    pub(crate) fn try_deadlock(&self, cycle: &[LockerId]) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, WaitState::Waiting) {
            *state = WaitState::Deadlock(cycle.to_vec());
            true
        } else {
            false
        }
    }

    /// Settles the timeout race. Caller holds the shard latch.
    pub(crate) fn try_abandon(&self) -> AbandonOutcome {
        let mut state = self.state.lock();
        match &*state {
            WaitState::Waiting => {
                *state = WaitState::Abandoned;
                AbandonOutcome::Abandoned
            }
            WaitState::Granted(grant) => AbandonOutcome::Granted(*grant),
            WaitState::Deadlock(cycle) => AbandonOutcome::Deadlock(cycle.clone()),
            WaitState::Abandoned => AbandonOutcome::Abandoned,
        }
    }

    /// Wakes the parked thread. Called after the shard latch is dropped.
    pub(crate) fn notify(&self) {
        self.wakeup.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(*self.state.lock(), WaitState::Waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_grant_before_park_returns_immediately() {
        let handle = WaitHandle::new();
        handle.grant(LockGrant::New);
        let outcome = handle.park(Instant::now() + Duration::from_secs(10));
        assert!(matches!(outcome, ParkOutcome::Granted(LockGrant::New)));
    }

    #[test]
    fn test_park_times_out() {
        let handle = WaitHandle::new();
        let outcome = handle.park(Instant::now() + Duration::from_millis(10));
        assert!(matches!(outcome, ParkOutcome::TimedOut));
        assert!(handle.is_waiting());
        assert!(matches!(handle.try_abandon(), AbandonOutcome::Abandoned));
        assert!(!handle.is_waiting());
    }

    #[test]
    fn test_abandon_loses_to_grant() {
        let handle = WaitHandle::new();
        handle.grant(LockGrant::Promotion);
        assert!(matches!(
            handle.try_abandon(),
            AbandonOutcome::Granted(LockGrant::Promotion)
        ));
    }

    #[test]
    fn test_deadlock_only_marks_waiting() {
        let handle = WaitHandle::new();
        let cycle = vec![LockerId::new(1), LockerId::new(2)];
        assert!(handle.try_deadlock(&cycle));
        assert!(!handle.try_deadlock(&cycle));

        let granted = WaitHandle::new();
        granted.grant(LockGrant::New);
        assert!(!granted.try_deadlock(&cycle));
    }

    #[test]
    fn test_park_observes_deadlock() {
        let handle = WaitHandle::new();
        handle.try_deadlock(&[LockerId::new(3)]);
        match handle.park(Instant::now() + Duration::from_secs(1)) {
            ParkOutcome::Deadlock(cycle) => assert_eq!(cycle, vec![LockerId::new(3)]),
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_cross_thread_grant_wakes_parker() {
        let handle = WaitHandle::new();
        let parker = Arc::clone(&handle);
        let thread = thread::spawn(move || parker.park(Instant::now() + Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        handle.grant(LockGrant::New);
        handle.notify();

        let outcome = thread.join().unwrap();
        assert!(matches!(outcome, ParkOutcome::Granted(LockGrant::New)));
    }
}
