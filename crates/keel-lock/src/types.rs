//! Lock types and grant outcomes.
//!
//! KeelDB locks records at their LSN with six lock types. READ and WRITE
//! are the classic shared/exclusive pair; the RANGE_* types only appear
//! under serializable isolation, where they pin the open interval between
//! a record and its successor against phantom inserts.
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!              │ READ │ WRITE │ R_READ │ R_WRITE │ R_INSERT │
//! ─────────────┼──────┼───────┼────────┼─────────┼──────────┤
//!    READ      │  ✓   │   ✗   │   ✓    │    ✗    │    ✗     │
//!    WRITE     │  ✗   │   ✗   │   ✗    │    ✗    │    ✗     │
//!    R_READ    │  ✓   │   ✗   │   ✓    │    ✗    │    ✗     │
//!    R_WRITE   │  ✗   │   ✗   │   ✗    │    ✗    │    ✗     │
//!    R_INSERT  │  ✗   │   ✗   │   ✗    │    ✗    │    ✗     │
//! ```
//!
//! The matrix is symmetric. NONE rows and columns are omitted: a NONE
//! request is satisfied without touching the lock table at all.

use std::fmt;

/// Lock type requested on or held against a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// No lock. Requests of this type are satisfied trivially and never
    /// stored; the degraded form of RANGE_INSERT outside serializable mode.
    None,
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// Shared lock that also pins the range up to the next record.
    RangeRead,
    /// Exclusive lock that also pins the range up to the next record.
    RangeWrite,
    /// Insertion lock on the successor record, blocking all other access
    /// while a new record is spliced in front of it.
    RangeInsert,
}

impl LockType {
    /// Checks if this lock type is compatible with another held by a
    /// different locker.
    pub fn is_compatible_with(&self, other: &LockType) -> bool {
        use LockType::*;
        matches!(
            (self, other),
            // NONE excludes nothing
            (None, _) | (_, None) |
            // shared types admit each other
            (Read, Read) | (Read, RangeRead) | (RangeRead, Read) | (RangeRead, RangeRead)
        )
    }

    /// Checks if holding `self` already satisfies a request for `requested`.
    ///
    /// This is the partial order behind `Existing` grants: a covered request
    /// returns without changing the lock.
    pub fn covers(self, requested: LockType) -> bool {
        use LockType::*;
        matches!(
            (self, requested),
            (_, None)
                | (Read, Read)
                | (Write, Read | Write)
                | (RangeRead, Read | RangeRead)
                | (RangeWrite, _)
                | (RangeInsert, RangeInsert)
        )
    }

    /// Returns the least upper bound of two lock types.
    ///
    /// Upgrades replace an owner's held type with the join of held and
    /// requested. RANGE_WRITE sits at the top, so every incomparable pair
    /// (WRITE with RANGE_READ being the common one) meets there.
    pub fn join(self, other: LockType) -> LockType {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            LockType::RangeWrite
        }
    }

    /// Checks if this is an exclusive (write-class) lock type.
    pub fn is_write_lock(&self) -> bool {
        matches!(
            self,
            LockType::Write | LockType::RangeWrite | LockType::RangeInsert
        )
    }

    /// Returns the shared type a write-class lock demotes to.
    ///
    /// RANGE_WRITE keeps its range component; the other write types drop
    /// to a plain READ.
    pub fn demoted(self) -> LockType {
        match self {
            LockType::RangeWrite => LockType::RangeRead,
            LockType::Write | LockType::RangeInsert => LockType::Read,
            other => other,
        }
    }

    /// Returns the non-range equivalent used outside serializable mode.
    ///
    /// RANGE_INSERT exists only to exclude phantoms, so it degrades to
    /// NONE rather than to a write lock.
    pub fn without_range(self) -> LockType {
        match self {
            LockType::RangeRead => LockType::Read,
            LockType::RangeWrite => LockType::Write,
            LockType::RangeInsert => LockType::None,
            other => other,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::None => write!(f, "NONE"),
            LockType::Read => write!(f, "READ"),
            LockType::Write => write!(f, "WRITE"),
            LockType::RangeRead => write!(f, "RANGE_READ"),
            LockType::RangeWrite => write!(f, "RANGE_WRITE"),
            LockType::RangeInsert => write!(f, "RANGE_INSERT"),
        }
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// The locker became a new owner.
    New,
    /// The locker already held a covering lock; nothing changed.
    Existing,
    /// The locker's held type was upgraded in place.
    Promotion,
    /// A NONE-type request; the lock table was never consulted.
    NotNeeded,
    /// Non-blocking request refused due to conflicting owners.
    Denied,
    /// The request was queued behind conflicting owners. Blocking calls
    /// resolve this to one of the grant variants (or an error) before
    /// returning; it is surfaced only in logs and diagnostics.
    Enqueued,
}

impl LockGrant {
    /// Returns true if the lock is held after this outcome.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            LockGrant::New | LockGrant::Existing | LockGrant::Promotion | LockGrant::NotNeeded
        )
    }
}

impl fmt::Display for LockGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockGrant::New => write!(f, "new"),
            LockGrant::Existing => write!(f, "existing"),
            LockGrant::Promotion => write!(f, "promotion"),
            LockGrant::NotNeeded => write!(f, "not-needed"),
            LockGrant::Denied => write!(f, "denied"),
            LockGrant::Enqueued => write!(f, "enqueued"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LockType; 6] = [
        LockType::None,
        LockType::Read,
        LockType::Write,
        LockType::RangeRead,
        LockType::RangeWrite,
        LockType::RangeInsert,
    ];

    #[test]
    fn test_compatibility_is_symmetric() {
        for a in ALL {
            for b in ALL {
                assert_eq!(
                    a.is_compatible_with(&b),
                    b.is_compatible_with(&a),
                    "asymmetry between {a} and {b}"
                );
            }
        }
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockType::*;
        assert!(Read.is_compatible_with(&Read));
        assert!(Read.is_compatible_with(&RangeRead));
        assert!(RangeRead.is_compatible_with(&RangeRead));

        assert!(!Read.is_compatible_with(&Write));
        assert!(!Write.is_compatible_with(&Write));
        assert!(!RangeRead.is_compatible_with(&RangeWrite));
        assert!(!RangeWrite.is_compatible_with(&RangeWrite));

        // RANGE_INSERT excludes everything, including reads
        assert!(!RangeInsert.is_compatible_with(&Read));
        assert!(!RangeInsert.is_compatible_with(&RangeRead));
        assert!(!RangeInsert.is_compatible_with(&RangeInsert));

        // NONE excludes nothing
        for t in ALL {
            assert!(None.is_compatible_with(&t));
        }
    }

    #[test]
    fn test_covers_is_reflexive() {
        for t in ALL {
            assert!(t.covers(t), "{t} must cover itself");
        }
    }

    #[test]
    fn test_covers() {
        use LockType::*;
        assert!(Write.covers(Read));
        assert!(RangeRead.covers(Read));
        assert!(RangeWrite.covers(Write));
        assert!(RangeWrite.covers(RangeRead));

        assert!(!Read.covers(Write));
        assert!(!Read.covers(RangeRead));
        assert!(!Write.covers(RangeRead));
        assert!(!RangeRead.covers(Write));
        assert!(!RangeInsert.covers(Read));

        // everything satisfies a NONE request
        for t in ALL {
            assert!(t.covers(None));
        }
    }

    #[test]
    fn test_join_upper_bound() {
        for a in ALL {
            for b in ALL {
                let j = a.join(b);
                assert!(j.covers(a), "join({a}, {b}) = {j} does not cover {a}");
                assert!(j.covers(b), "join({a}, {b}) = {j} does not cover {b}");
            }
        }
    }

    #[test]
    fn test_join() {
        use LockType::*;
        assert_eq!(Read.join(Write), Write);
        assert_eq!(Read.join(RangeRead), RangeRead);
        assert_eq!(Write.join(RangeRead), RangeWrite);
        assert_eq!(RangeRead.join(Write), RangeWrite);
        assert_eq!(Write.join(Write), Write);
        assert_eq!(RangeWrite.join(Read), RangeWrite);
    }

    #[test]
    fn test_write_classification() {
        use LockType::*;
        assert!(Write.is_write_lock());
        assert!(RangeWrite.is_write_lock());
        assert!(RangeInsert.is_write_lock());
        assert!(!Read.is_write_lock());
        assert!(!RangeRead.is_write_lock());
        assert!(!None.is_write_lock());
    }

    #[test]
    fn test_demoted() {
        use LockType::*;
        assert_eq!(Write.demoted(), Read);
        assert_eq!(RangeWrite.demoted(), RangeRead);
        assert_eq!(Read.demoted(), Read);
    }

    #[test]
    fn test_without_range() {
        use LockType::*;
        assert_eq!(RangeRead.without_range(), Read);
        assert_eq!(RangeWrite.without_range(), Write);
        assert_eq!(RangeInsert.without_range(), None);
        assert_eq!(Read.without_range(), Read);
        assert_eq!(Write.without_range(), Write);
    }

    #[test]
    fn test_grant_success() {
        assert!(LockGrant::New.is_success());
        assert!(LockGrant::Existing.is_success());
        assert!(LockGrant::Promotion.is_success());
        assert!(LockGrant::NotNeeded.is_success());
        assert!(!LockGrant::Denied.is_success());
        assert!(!LockGrant::Enqueued.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(LockType::Write.to_string(), "WRITE");
        assert_eq!(LockType::RangeInsert.to_string(), "RANGE_INSERT");
        assert_eq!(LockGrant::Promotion.to_string(), "promotion");
    }
}
