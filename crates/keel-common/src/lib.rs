//! # keel-common
//!
//! Common types, constants, and memory accounting for KeelDB.
//!
//! This crate provides the foundational pieces shared across KeelDB
//! components. It includes:
//!
//! - **Types**: Core identifiers (`Lsn`, `LockerId`)
//! - **Constants**: Sizing defaults and limits shared across components
//! - **Memory**: The shared `MemoryBudget` accountant and cache-line
//!   alignment helpers
//!
//! ## Example
//!
//! ```rust
//! use keel_common::memory::MemoryBudget;
//! use keel_common::types::{LockerId, Lsn};
//!
//! let budget = MemoryBudget::new(64 * 1024 * 1024, 16);
//! let resource = Lsn::new(42);
//! let locker = LockerId::new(1);
//! assert!(resource.is_valid() && locker.is_valid());
//! assert_eq!(budget.usage(), 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod memory;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use memory::{CacheLineAligned, MemoryBudget};
pub use types::{LockerId, Lsn};
