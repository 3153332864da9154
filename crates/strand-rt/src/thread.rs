// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative thread state machine and arena.
//!
//! Threads move between Runnable, Running, Blocked, and Dead only
//! through the queue-transition operations here, all executed on the
//! carrier. At most one thread is Running per runtime instance. The
//! Blocked->Runnable wake is idempotent: a spurious repeat firing
//! (I/O event racing a timeout) observes a no-op.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::os::unix::io::RawFd;
use std::time::Instant;

use bitflags::bitflags;
use tracing::trace;

use crate::error::Result;
use crate::switch::{Stack, StrandCtl, SwitchReason, WakeReason};

/// Identity of a cooperative thread within one runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible for resumption.
    Runnable,
    /// Currently executing. Exactly one per runtime instance.
    Running,
    /// Parked on >= 1 registration and/or a deadline.
    Blocked,
    /// Entry function returned; stack recyclable.
    Dead,
}

/// Worker threads keep the runtime alive; daemons do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Worker,
    Daemon,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u8 {
        /// Last wake came from the deadline path, not an I/O event.
        const TIMED_OUT = 0b01;
    }
}

/// Abstract lightweight thread: explicit state machine, waiter list of
/// registered descriptors, opaque stack, opaque private-data slot.
pub struct CooperativeThread {
    id: ThreadId,
    state: ThreadState,
    kind: ThreadKind,
    flags: ThreadFlags,
    wakeup: Option<Instant>,
    stack: Stack,
    waiters: Vec<RawFd>,
    private: Option<Box<dyn Any + Send>>,
}

impl CooperativeThread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ThreadFlags) {
        self.flags |= flag;
    }

    pub fn unset_flag(&mut self, flag: ThreadFlags) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: ThreadFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Absolute wakeup deadline, if parked with one.
    pub fn wakeup_time(&self) -> Option<Instant> {
        self.wakeup
    }

    pub fn set_private(&mut self, data: Box<dyn Any + Send>) {
        self.private = Some(data);
    }

    pub fn private(&self) -> Option<&(dyn Any + Send)> {
        self.private.as_deref()
    }

    pub fn take_private(&mut self) -> Option<Box<dyn Any + Send>> {
        self.private.take()
    }

    /// Current Blocked membership, by descriptor.
    pub fn waiters(&self) -> &[RawFd] {
        &self.waiters
    }

    pub fn clear_waiters(&mut self) {
        self.waiters.clear();
    }

    pub fn add_waiter(&mut self, fd: RawFd) {
        self.waiters.push(fd);
    }

    pub fn add_waiters<I: IntoIterator<Item = RawFd>>(&mut self, fds: I) {
        self.waiters.extend(fds);
    }
}

/// Arena of cooperative threads plus the scheduling queues: FIFO run
/// queue and the wakeup-deadline min-heap (stale entries are discarded
/// lazily when encountered).
pub struct Threads {
    slots: Vec<Option<CooperativeThread>>,
    free: Vec<usize>,
    run_queue: VecDeque<ThreadId>,
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
    live_workers: usize,
}

impl Threads {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            run_queue: VecDeque::new(),
            deadlines: BinaryHeap::new(),
            live_workers: 0,
        }
    }

    /// Create a thread with a fresh stack, entry function pending its
    /// first resume, and insert it Runnable.
    pub(crate) fn insert(
        &mut self,
        kind: ThreadKind,
        entry: Box<dyn FnOnce(&StrandCtl) + Send + 'static>,
    ) -> Result<ThreadId> {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        let id = ThreadId::from_index(index);
        let stack = Stack::spawn(id, entry)?;
        self.slots[index] = Some(CooperativeThread {
            id,
            state: ThreadState::Runnable,
            kind,
            flags: ThreadFlags::empty(),
            wakeup: None,
            stack,
            waiters: Vec::new(),
            private: None,
        });
        if kind == ThreadKind::Worker {
            self.live_workers += 1;
        }
        self.run_queue.push_back(id);
        trace!(strand = index, ?kind, "spawned");
        Ok(id)
    }

    pub fn get(&self, id: ThreadId) -> Option<&CooperativeThread> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut CooperativeThread> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Live threads whose kind keeps the runtime alive.
    pub fn live_workers(&self) -> usize {
        self.live_workers
    }

    pub fn is_blocked(&self, id: ThreadId) -> bool {
        self.get(id).map_or(false, |t| t.state == ThreadState::Blocked)
    }

    /// Pop the next thread eligible for resumption, FIFO.
    pub(crate) fn next_runnable(&mut self) -> Option<ThreadId> {
        while let Some(id) = self.run_queue.pop_front() {
            match self.get(id) {
                Some(t) if t.state == ThreadState::Runnable => return Some(id),
                // Double insertion into Runnable is a scheduler defect.
                other => debug_assert!(
                    false,
                    "run queue held thread {} in state {:?}",
                    id.index(),
                    other.map(|t| t.state)
                ),
            }
        }
        None
    }

    /// Runnable -> Running, then switch into the thread's stack.
    /// Returns the reason it switched back, or None if the id is dead.
    pub(crate) fn resume(&mut self, id: ThreadId) -> Option<SwitchReason> {
        let thread = self.get_mut(id)?;
        debug_assert_eq!(thread.state, ThreadState::Runnable);
        thread.state = ThreadState::Running;
        Some(thread.stack.resume())
    }

    /// Running -> Runnable (voluntary yield).
    pub(crate) fn make_runnable(&mut self, id: ThreadId) {
        let Some(thread) = self.get_mut(id) else {
            debug_assert!(false, "make_runnable on missing thread {}", id.index());
            return;
        };
        debug_assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Runnable;
        self.run_queue.push_back(id);
    }

    /// Running -> Blocked, recording the absolute deadline if any.
    pub(crate) fn block(&mut self, id: ThreadId, deadline: Option<Instant>) {
        let Some(thread) = self.get_mut(id) else {
            debug_assert!(false, "block on missing thread {}", id.index());
            return;
        };
        debug_assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Blocked;
        thread.wakeup = deadline;
        thread.unset_flag(ThreadFlags::TIMED_OUT);
        if let Some(at) = deadline {
            self.deadlines.push(Reverse((at, id.index() as u32)));
        }
    }

    /// Blocked -> Runnable with the park outcome. Idempotent: only the
    /// first firing transitions; a repeat observes a no-op and returns
    /// false. The caller must already have torn down the waiter list.
    pub(crate) fn wake(&mut self, id: ThreadId, outcome: Result<WakeReason>) -> bool {
        let Some(thread) = self.get_mut(id) else {
            debug_assert!(false, "wake on missing thread {}", id.index());
            return false;
        };
        debug_assert_ne!(thread.state, ThreadState::Dead, "wake on dead thread");
        if thread.state != ThreadState::Blocked {
            return false;
        }
        debug_assert!(
            thread.waiters.is_empty(),
            "thread {} re-entered Runnable with live waiter memberships",
            id.index()
        );
        if matches!(outcome, Ok(WakeReason::TimedOut)) {
            thread.flags |= ThreadFlags::TIMED_OUT;
        }
        thread.wakeup = None;
        thread.stack.deliver_wake(outcome);
        thread.state = ThreadState::Runnable;
        self.run_queue.push_back(id);
        true
    }

    /// Deliver a park outcome to a thread that never reached Blocked
    /// (its schedule call failed) and requeue it.
    pub(crate) fn fail_park(&mut self, id: ThreadId, err: crate::error::RtError) {
        if let Some(thread) = self.get_mut(id) {
            thread.stack.deliver_wake(Err(err));
        }
        self.make_runnable(id);
    }

    /// Running -> Dead. Joins and releases the stack, frees the slot.
    pub(crate) fn finish(&mut self, id: ThreadId) {
        let Some(mut thread) = self.slots.get_mut(id.index()).and_then(|s| s.take()) else {
            debug_assert!(false, "finish on missing thread {}", id.index());
            return;
        };
        debug_assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Dead;
        thread.stack.join();
        if thread.kind == ThreadKind::Worker {
            debug_assert!(self.live_workers > 0);
            self.live_workers -= 1;
        }
        self.free.push(id.index());
        trace!(strand = id.index(), "finished");
    }

    /// Replace the thread's waiter list with the given descriptors.
    pub(crate) fn set_waiters(&mut self, id: ThreadId, fds: impl IntoIterator<Item = RawFd>) {
        if let Some(thread) = self.get_mut(id) {
            thread.clear_waiters();
            thread.add_waiters(fds);
        }
    }

    /// Take the thread's current waiter memberships for teardown.
    pub(crate) fn take_waiters(&mut self, id: ThreadId) -> Vec<RawFd> {
        self.get_mut(id)
            .map(|t| std::mem::take(&mut t.waiters))
            .unwrap_or_default()
    }

    /// Nearest pending deadline across all Blocked threads. Discards
    /// stale heap entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((at, index))) = self.deadlines.peek() {
            if self.entry_is_current(at, index) {
                return Some(at);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Pop one thread whose deadline has elapsed, if any.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<ThreadId> {
        while let Some(&Reverse((at, index))) = self.deadlines.peek() {
            if !self.entry_is_current(at, index) {
                self.deadlines.pop();
                continue;
            }
            if at > now {
                return None;
            }
            self.deadlines.pop();
            return Some(ThreadId::from_index(index as usize));
        }
        None
    }

    /// A heap entry is current only while its thread is still Blocked
    /// on exactly that deadline.
    fn entry_is_current(&self, at: Instant, index: u32) -> bool {
        self.slots
            .get(index as usize)
            .and_then(|s| s.as_ref())
            .map_or(false, |t| {
                t.state == ThreadState::Blocked && t.wakeup == Some(at)
            })
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}
