//! System-wide constants for KeelDB.
//!
//! This module defines constants used across the engine. The lock-table
//! values mirror the sizing the rest of the cache layer assumes.

// =============================================================================
// Lock Table Constants
// =============================================================================

/// Default number of lock-table shards.
///
/// Each shard carries its own latch and hash map, so this bounds lock-path
/// contention between unrelated resources. Sixteen keeps the per-shard
/// footprint small while spreading monotonically allocated LSNs evenly.
pub const DEFAULT_LOCK_SHARDS: usize = 16;

/// Maximum number of lock-table shards accepted by configuration.
pub const MAX_LOCK_SHARDS: usize = 1024;

/// Default time a lock request waits on a conflict before failing.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Delay between the first observed lock conflict and the deadlock
/// detection pass that examines it.
///
/// Most conflicts resolve on their own within a few milliseconds; waiting
/// before walking the wait-for graph keeps the detector off the hot path.
pub const DEFAULT_DEADLOCK_DETECT_DELAY_MS: u64 = 100;

// =============================================================================
// Memory Budget Constants
// =============================================================================

/// Default cache budget (1 GB).
///
/// Upper bound the eviction layer steers toward. The budget itself is pure
/// bookkeeping: charges and credits are recorded here and read by the
/// evictor, never enforced at the charge site.
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 1024 * 1024 * 1024;
