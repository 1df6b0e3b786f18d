//! Lock manager error types.
//!
//! This module defines all error types for lock acquisition and release.

use std::time::Duration;

use thiserror::Error;

use keel_common::types::{LockerId, Lsn};

use crate::types::LockType;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The wait for a lock exceeded its timeout.
    ///
    /// Carries a snapshot of the contended lock taken while abandoning the
    /// wait, so the caller can log who was in the way.
    #[error("Lock timeout after {timeout:?}: locker {locker} waiting for {lock_type} on LSN {resource} ({n_owners} owners, {n_waiters} waiters)")]
    Timeout {
        /// The locker whose wait timed out.
        locker: LockerId,
        /// The contended record.
        resource: Lsn,
        /// The requested lock type.
        lock_type: LockType,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Owners of the lock at abandonment time.
        n_owners: usize,
        /// Remaining waiters at abandonment time.
        n_waiters: usize,
    },

    /// The locker was chosen as a deadlock victim and must abort.
    #[error("Deadlock: locker {locker} chosen as victim in cycle {cycle:?}")]
    Deadlock {
        /// The victim.
        locker: LockerId,
        /// The wait-for cycle the victim was part of.
        cycle: Vec<LockerId>,
    },

    /// The locker's lock was stolen and its exclusivity can no longer be
    /// trusted; the transaction must abort before touching more state.
    #[error("Lock preempted: locker {locker} lost ownership before requesting LSN {resource}")]
    Preempted {
        /// The preempted locker.
        locker: LockerId,
        /// The record it was about to lock when the preemption surfaced.
        resource: Lsn,
    },

    /// Operation on a locker that has already ended.
    #[error("Locker {locker} has already ended")]
    LockerShutdown {
        /// The ended locker.
        locker: LockerId,
    },

    /// Invariant violation or unusable configuration. Not recoverable by
    /// retrying.
    #[error("Internal lock manager error: {reason}")]
    Internal {
        /// What went wrong.
        reason: String,
    },
}

impl LockError {
    /// Creates a timeout error.
    pub fn timeout(
        locker: LockerId,
        resource: Lsn,
        lock_type: LockType,
        timeout: Duration,
        n_owners: usize,
        n_waiters: usize,
    ) -> Self {
        Self::Timeout {
            locker,
            resource,
            lock_type,
            timeout,
            n_owners,
            n_waiters,
        }
    }

    /// Creates a deadlock error.
    pub fn deadlock(locker: LockerId, cycle: Vec<LockerId>) -> Self {
        Self::Deadlock { locker, cycle }
    }

    /// Creates a preemption error.
    pub fn preempted(locker: LockerId, resource: Lsn) -> Self {
        Self::Preempted { locker, resource }
    }

    /// Creates an internal invariant error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Returns true if retrying in a fresh transaction can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Deadlock { .. } | Self::Preempted { .. }
        )
    }

    /// Returns true if this error means the transaction must abort.
    pub fn requires_abort(&self) -> bool {
        matches!(self, Self::Deadlock { .. } | Self::Preempted { .. })
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a deadlock abort.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}
