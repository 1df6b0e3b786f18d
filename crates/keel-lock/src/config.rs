//! Lock manager configuration.
//!
//! This module provides configuration options for the lock manager.

use std::time::Duration;

use keel_common::constants::{
    DEFAULT_DEADLOCK_DETECT_DELAY_MS, DEFAULT_LOCK_SHARDS, DEFAULT_LOCK_TIMEOUT_MS,
    MAX_LOCK_SHARDS,
};

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Number of lock-table shards. Fixed for the life of the manager.
    pub n_shards: usize,

    /// Default timeout for blocking lock requests. Callers can override
    /// per request.
    pub lock_timeout: Duration,

    /// Whether to run the background deadlock detector.
    pub deadlock_detection: bool,

    /// Delay between the first observed conflict and the detection pass.
    pub deadlock_detect_delay: Duration,

    /// Whether serializable isolation is in effect. When disabled, the
    /// RANGE_* lock types degrade to their non-range equivalents before
    /// touching the lock table.
    pub serializable: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            n_shards: DEFAULT_LOCK_SHARDS,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            deadlock_detection: true,
            deadlock_detect_delay: Duration::from_millis(DEFAULT_DEADLOCK_DETECT_DELAY_MS),
            serializable: false,
        }
    }
}

impl LockConfig {
    /// Creates a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration suited to tests: few shards, short waits,
    /// an eager detector, and serializable isolation so every lock type
    /// is reachable.
    pub fn for_testing() -> Self {
        Self {
            n_shards: 4,
            lock_timeout: Duration::from_secs(2),
            deadlock_detection: true,
            deadlock_detect_delay: Duration::from_millis(10),
            serializable: true,
        }
    }

    /// Sets the shard count.
    #[must_use]
    pub fn with_n_shards(mut self, n_shards: usize) -> Self {
        self.n_shards = n_shards;
        self
    }

    /// Sets the default lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether deadlock detection runs.
    #[must_use]
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    /// Sets the deadlock detection delay.
    #[must_use]
    pub fn with_deadlock_detect_delay(mut self, delay: Duration) -> Self {
        self.deadlock_detect_delay = delay;
        self
    }

    /// Sets serializable isolation.
    #[must_use]
    pub fn with_serializable(mut self, serializable: bool) -> Self {
        self.serializable = serializable;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_shards == 0 {
            return Err("Shard count must be positive".to_string());
        }

        if self.n_shards > MAX_LOCK_SHARDS {
            return Err(format!("Shard count must be at most {MAX_LOCK_SHARDS}"));
        }

        if self.lock_timeout.is_zero() {
            return Err("Lock timeout must be positive".to_string());
        }

        if self.deadlock_detection && self.deadlock_detect_delay >= self.lock_timeout {
            return Err(
                "Deadlock detect delay must be shorter than the lock timeout".to_string(),
            );
        }

        Ok(())
    }
}
