//! Memory utilities for KeelDB.
//!
//! This module provides the pieces the cache layer needs to account for
//! itself:
//!
//! - **Cache-line alignment**: padding wrapper to keep hot atomics off each
//!   other's cache lines
//! - **Memory budget**: the shared byte accountant components charge their
//!   footprint into

mod aligned;
mod budget;

pub use aligned::{CacheLineAligned, CACHE_LINE_SIZE};
pub use budget::MemoryBudget;
