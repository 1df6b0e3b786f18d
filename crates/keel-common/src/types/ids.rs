//! Strongly-typed identifiers used across KeelDB.
//!
//! These are newtype wrappers around primitive integers that prevent
//! accidentally mixing up different kinds of IDs at compile time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Log Sequence Number - the durable address of a record.
///
/// LSNs are monotonically increasing and serve double duty in KeelDB:
/// - Order log records and track recovery progress
/// - Name a record as a lockable resource (a lock on a record is a lock
///   on the LSN it currently lives at)
///
/// # Example
///
/// ```rust
/// use keel_common::types::Lsn;
///
/// let record = Lsn::new(4096);
/// assert!(record.is_valid());
/// assert_eq!(record.as_u64(), 4096);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Sentinel meaning "no address". Never assigned to a live record.
    pub const INVALID: Self = Self(0);

    /// Wraps a raw log offset.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Unwraps to the raw log offset.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True unless this is the `INVALID` sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Lsn(INVALID)")
        } else {
            write!(f, "Lsn({})", self.0)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    #[inline]
    fn from(lsn: u64) -> Self {
        Self::new(lsn)
    }
}

impl From<Lsn> for u64 {
    #[inline]
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Locker identifier - uniquely identifies a lock-holding agent.
///
/// Locker IDs are allocated monotonically by the lock manager, so ordering
/// two IDs also orders the lockers by creation time. That ordering is what
/// deadlock victim selection means by "youngest".
///
/// # Example
///
/// ```rust
/// use keel_common::types::LockerId;
///
/// let locker = LockerId::new(1);
/// assert!(locker.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LockerId(u64);

impl LockerId {
    /// Sentinel meaning "no locker". Never allocated to a live agent.
    pub const INVALID: Self = Self(0);

    /// First ID the manager hands out.
    pub const MIN: Self = Self(1);

    /// Wraps a raw locker number.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Unwraps to the raw locker number.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True unless this is the `INVALID` sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "LockerId(INVALID)")
        } else {
            write!(f, "LockerId({})", self.0)
        }
    }
}

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LockerId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<LockerId> for u64 {
    #[inline]
    fn from(id: LockerId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_roundtrip_and_validity() {
        let lsn = Lsn::new(100);
        assert_eq!(lsn.as_u64(), 100);
        assert_eq!(u64::from(lsn), 100);
        assert_eq!(Lsn::from(100u64), lsn);
        assert!(lsn.is_valid());
        assert!(!Lsn::INVALID.is_valid());
    }

    #[test]
    fn test_locker_allocation_order_is_age_order() {
        // Victim selection reads "younger" as "greater id".
        assert!(LockerId::MIN > LockerId::INVALID);
        assert!(LockerId::new(1) < LockerId::new(2));
        assert!(LockerId::MIN.is_valid());
        assert!(!LockerId::INVALID.is_valid());
    }

    #[test]
    fn test_lsn_ordering_follows_raw_offsets() {
        assert!(Lsn::new(1) < Lsn::new(2));
        assert!(Lsn::INVALID < Lsn::new(1));
    }

    #[test]
    fn test_debug_marks_sentinels() {
        assert_eq!(format!("{:?}", Lsn::INVALID), "Lsn(INVALID)");
        assert_eq!(format!("{:?}", Lsn::new(5)), "Lsn(5)");
        assert_eq!(format!("{:?}", LockerId::INVALID), "LockerId(INVALID)");
        assert_eq!(format!("{:?}", LockerId::new(3)), "LockerId(3)");
        assert_eq!(format!("{}", LockerId::new(3)), "3");
    }
}
