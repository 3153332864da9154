// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! An explicit config object handed to `Runtime::new` instead of
//! process-wide constants. Capacity is fixed at construction; the poll
//! ceiling stays mutable on the dispatcher.

use std::time::Duration;

/// Default descriptor-table capacity.
pub const DEFAULT_CAPACITY: usize = 8192;

/// Default upper bound on a single multiplexer wait.
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Size of the descriptor-indexed table. A descriptor is addressable
    /// only if `0 <= fd < capacity`.
    pub capacity: usize,
    /// Longest a single `dispatch` call may sit in the multiplexer when
    /// no deadline comes sooner.
    pub poll_ceiling: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            poll_ceiling: DEFAULT_POLL_CEILING,
        }
    }
}

impl RuntimeConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }
}
