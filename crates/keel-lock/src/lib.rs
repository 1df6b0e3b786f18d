//! # keel-lock
//!
//! Record-level lock manager for KeelDB.
//!
//! This crate provides the locking layer transactions run on:
//!
//! - **Lock types**: shared and exclusive locks plus the range variants
//!   (RANGE_READ, RANGE_WRITE, RANGE_INSERT) that serializable isolation
//!   uses to keep phantoms out.
//!
//! - **Adaptive representation**: uncontended locks store one inline
//!   owner; the first contender converts them to an owner list with a
//!   FIFO waiter queue.
//!
//! - **Blocking waits**: conflicting requests park on a condvar with a
//!   deadline and are woken in queue order as releases make them
//!   grantable.
//!
//! - **Deadlock detection**: a background thread sweeps waiters into a
//!   wait-for graph and aborts one victim per cycle, picked by priority
//!   and age.
//!
//! - **Memory accounting**: every owner and waiter entry is charged to a
//!   [`MemoryBudget`](keel_common::MemoryBudget), so the engine can see
//!   exactly what the lock table costs.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        LockManager                            │
//! │     lockers ──► Locker (owned set, preempted/ended flags)     │
//! │                          │                                    │
//! │    ┌─────────────────────┼────────────────────┐               │
//! │    ▼                     ▼                    ▼               │
//! │ ┌───────────┐     ┌──────────────┐   ┌──────────────────┐    │
//! │ │ LockTable │     │ MemoryBudget │   │ DeadlockDetector │    │
//! │ │ (shards)  │     │ (per shard)  │   │ (wait-for graph) │    │
//! │ └───────────┘     └──────────────┘   └──────────────────┘    │
//! │       │                                                      │
//! │       ▼                                                      │
//! │  Lock: Thin(owner) or Multi(owners + FIFO waiter queue)      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use keel_lock::{LockConfig, LockManager, LockType, Lsn};
//!
//! let manager = LockManager::with_config(LockConfig::default())?;
//!
//! // A locker stands in for a transaction.
//! let txn = manager.begin_locker();
//!
//! // Blocking acquire with the configured timeout.
//! manager.lock(txn, Lsn::new(1000), LockType::Write, None)?;
//!
//! // Drop everything the locker holds and forget it.
//! manager.end_locker(txn);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod lock;
mod table;
mod wait;

/// Lock manager configuration.
///
/// This module provides:
/// - [`config::LockConfig`]: shard count, timeouts, detection, isolation
pub mod config;

/// Deadlock detection over the wait-for graph.
///
/// This module provides:
/// - [`deadlock::WaitForGraph`]: wait-for edges between lockers
/// - [`deadlock::DeadlockInfo`]: a detected cycle and its victim
pub mod deadlock;

/// Error types.
///
/// This module provides:
/// - [`error::LockError`]: timeout, deadlock, preemption, shutdown
/// - [`error::LockResult`]: result alias used throughout the crate
pub mod error;

/// Lock-holding agents.
///
/// This module provides:
/// - [`locker::Locker`]: one transaction's locking identity
pub mod locker;

/// The lock manager facade.
///
/// This module provides:
/// - [`manager::LockManager`]: acquire, release, steal, demote
/// - [`manager::LockEventListener`]: lifecycle event callbacks
/// - [`manager::LockStats`]: counters
pub mod manager;

/// Lock types and grant outcomes.
///
/// This module provides:
/// - [`types::LockType`]: the compatibility and coverage lattice
/// - [`types::LockGrant`]: how a request was satisfied
pub mod types;

// Re-export commonly used types

pub use config::LockConfig;

pub use deadlock::{DeadlockInfo, WaitForGraph};

pub use error::{LockError, LockResult};

pub use locker::Locker;

pub use manager::{LockEventListener, LockManager, LockStats, NoopListener};

pub use types::{LockGrant, LockType};

pub use keel_common::types::{LockerId, Lsn};
