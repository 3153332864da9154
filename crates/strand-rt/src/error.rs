// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error taxonomy.
//!
//! Range-checked operations return recoverable errors. Multiplexer
//! creation failure is fatal to that dispatcher instance. Scheduler
//! invariant violations are defects, surfaced via `debug_assert!` at
//! the call sites rather than through this enum.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RtError>;

#[derive(Debug, Error)]
pub enum RtError {
    /// A descriptor outside `[0, capacity)` was passed to the dispatcher.
    #[error("descriptor {fd} outside [0, {capacity})")]
    DescriptorOutOfRange { fd: RawFd, capacity: usize },

    /// The descriptor is in range but has no registration in the table.
    #[error("descriptor {fd} is not registered")]
    NotRegistered { fd: RawFd },

    /// Creating the OS multiplexer failed. Fatal to the dispatcher.
    #[error("multiplexer creation failed")]
    MultiplexerInit(#[source] io::Error),

    /// A multiplexer call failed with something other than EINTR.
    #[error("multiplexer failure")]
    Multiplexer(#[source] io::Error),

    /// The dispatcher was closed; no further dispatch is possible.
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// A park with neither a wait set nor a deadline would never wake.
    #[error("park with no wait set and no deadline would never wake")]
    EmptyPark,

    /// The OS refused to back a new strand stack.
    #[error("failed to spawn strand stack")]
    Spawn(#[source] io::Error),
}
