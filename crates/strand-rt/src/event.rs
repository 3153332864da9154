// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event registration: one interest/readiness record per descriptor.
//!
//! A registered record lives in the dispatcher's descriptor-indexed
//! table; the descriptor is its identity. The owning thread's waiter
//! list refers to it by descriptor only, so registration and
//! deregistration stay symmetric by construction.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::thread::ThreadId;

bitflags! {
    /// Readiness/interest bits. `HANGUP` only ever appears in received
    /// masks; it is ignored on registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const HANGUP   = 0b100;
    }
}

/// Descriptor value of an unbound registration.
pub const UNBOUND_FD: RawFd = -1;

/// Closed set of registration kinds. Notification behavior is dispatched
/// on this tag rather than through open-ended inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    /// Record readiness only; the notification hooks are no-ops.
    #[default]
    Monitor,
    /// Wake the owning thread out of Blocked when readiness arrives.
    Park,
}

/// One descriptor a parking thread wants to wait on.
#[derive(Debug, Clone, Copy)]
pub struct WaitSpec {
    pub fd: RawFd,
    pub interest: EventMask,
}

impl WaitSpec {
    pub fn readable(fd: RawFd) -> Self {
        Self {
            fd,
            interest: EventMask::READABLE,
        }
    }

    pub fn writable(fd: RawFd) -> Self {
        Self {
            fd,
            interest: EventMask::WRITABLE,
        }
    }
}

/// Interest/readiness record bound to at most one descriptor.
///
/// While registered, the descriptor is >= 0 and unique within its
/// dispatcher's table, and the record is registered with at most one
/// dispatcher (its containing table).
#[derive(Debug)]
pub struct EventRegistration {
    fd: RawFd,
    interest: EventMask,
    received: EventMask,
    kind: EventKind,
    owner: Option<ThreadId>,
}

impl Default for EventRegistration {
    fn default() -> Self {
        Self {
            fd: UNBOUND_FD,
            interest: EventMask::empty(),
            received: EventMask::empty(),
            kind: EventKind::Monitor,
            owner: None,
        }
    }
}

impl EventRegistration {
    pub fn new(fd: RawFd, interest: EventMask, kind: EventKind) -> Self {
        Self {
            fd,
            interest,
            kind,
            ..Self::default()
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_fd(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    pub fn is_bound(&self) -> bool {
        self.fd >= 0
    }

    pub fn interest(&self) -> EventMask {
        self.interest
    }

    pub fn set_interest(&mut self, interest: EventMask) {
        self.interest = interest;
    }

    /// Mutates only the local mask. Propagation to the multiplexer is
    /// the dispatcher's explicit, separate step.
    pub fn enable_input(&mut self) {
        self.interest |= EventMask::READABLE;
    }

    pub fn enable_output(&mut self) {
        self.interest |= EventMask::WRITABLE;
    }

    pub fn disable_input(&mut self) {
        self.interest &= !EventMask::READABLE;
    }

    pub fn disable_output(&mut self) {
        self.interest &= !EventMask::WRITABLE;
    }

    pub fn received(&self) -> EventMask {
        self.received
    }

    pub fn set_received(&mut self, received: EventMask) {
        self.received = received;
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: EventKind) {
        self.kind = kind;
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Stores the back-reference only; the caller pairs this with the
    /// matching waiter-list operation.
    pub fn set_owner(&mut self, owner: Option<ThreadId>) {
        self.owner = owner;
    }

    /// Input-ready hook. Returns the thread to wake, if any.
    pub(crate) fn on_input(&mut self) -> Option<ThreadId> {
        match self.kind {
            EventKind::Monitor => None,
            EventKind::Park => self.owner,
        }
    }

    /// Output-ready hook.
    pub(crate) fn on_output(&mut self) -> Option<ThreadId> {
        match self.kind {
            EventKind::Monitor => None,
            EventKind::Park => self.owner,
        }
    }

    /// Hang-up hook. Parked threads are woken so the failed descriptor
    /// surfaces at the wait site instead of lingering in the table.
    pub(crate) fn on_hangup(&mut self) -> Option<ThreadId> {
        match self.kind {
            EventKind::Monitor => None,
            EventKind::Park => self.owner,
        }
    }

    /// Return the record to the unbound default for pooling.
    pub fn reset(&mut self) {
        self.fd = UNBOUND_FD;
        self.interest = EventMask::empty();
        self.received = EventMask::empty();
        self.kind = EventKind::Monitor;
        self.owner = None;
    }
}
