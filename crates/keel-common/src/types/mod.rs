//! Type definitions for KeelDB.
//!
//! This module contains the core identifier types used across the engine.

mod ids;

pub use ids::{LockerId, Lsn};
