// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event dispatcher: descriptor table + multiplexer + dispatch loop.
//!
//! The table is a direct-address array sized to capacity; slot index
//! equals the descriptor of the registration stored there. The
//! multiplexer's registration set mirrors the occupied slots. All
//! mutation happens on the carrier, so bulk operations are atomic
//! with respect to the dispatch loop.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RtError};
use crate::event::{EventMask, EventRegistration, WaitSpec};
use crate::mux::{Epoll, Multiplexer, ReadyEvent};
use crate::switch::WakeReason;
use crate::thread::{ThreadId, Threads};

pub struct EventDispatcher {
    capacity: usize,
    table: Vec<Option<EventRegistration>>,
    occupied: usize,
    mux: Box<dyn Multiplexer>,
    poll_ceiling: Duration,
    closed: bool,
    /// Reused readiness buffer for dispatch cycles.
    ready: Vec<ReadyEvent>,
}

impl EventDispatcher {
    /// Allocate the descriptor table and the OS multiplexer.
    /// Multiplexer creation failure is fatal to this instance.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let mux = Epoll::new().map_err(RtError::MultiplexerInit)?;
        Ok(Self::with_mux(config, Box::new(mux)))
    }

    /// Build against an explicit multiplexer backend.
    pub fn with_mux(config: &RuntimeConfig, mux: Box<dyn Multiplexer>) -> Self {
        let mut table = Vec::with_capacity(config.capacity);
        table.resize_with(config.capacity, || None);
        Self {
            capacity: config.capacity,
            table,
            occupied: 0,
            mux,
            poll_ceiling: config.poll_ceiling,
            closed: false,
            ready: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn poll_ceiling(&self) -> Duration {
        self.poll_ceiling
    }

    pub fn set_poll_ceiling(&mut self, ceiling: Duration) {
        self.poll_ceiling = ceiling;
    }

    /// Number of occupied table slots.
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// A descriptor is addressable only if `0 <= fd < capacity`.
    pub fn is_valid_fd(&self, fd: RawFd) -> bool {
        fd >= 0 && (fd as usize) < self.capacity
    }

    fn check_fd(&self, fd: RawFd) -> Result<usize> {
        if self.is_valid_fd(fd) {
            Ok(fd as usize)
        } else {
            Err(RtError::DescriptorOutOfRange {
                fd,
                capacity: self.capacity,
            })
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<&EventRegistration> {
        self.table.get(fd as usize).and_then(|s| s.as_ref())
    }

    /// Insert a registration at slot index = its descriptor and sync
    /// the multiplexer. Re-registering an occupied descriptor is
    /// last-write-wins on that slot only.
    ///
    /// Reusing an OS descriptor for a new connection without first
    /// unregistering its prior record is a caller hazard: the stale
    /// record would receive the new descriptor's events.
    pub fn register(&mut self, reg: EventRegistration) -> Result<()> {
        let index = self.check_fd(reg.fd())?;
        if self.table[index].is_some() {
            self.mux
                .modify(reg.fd(), reg.interest())
                .map_err(RtError::Multiplexer)?;
        } else {
            self.mux
                .register(reg.fd(), reg.interest())
                .map_err(RtError::Multiplexer)?;
            self.occupied += 1;
        }
        trace!(fd = reg.fd(), interest = ?reg.interest(), "registered");
        self.table[index] = Some(reg);
        Ok(())
    }

    /// Remove the registration for `fd`, sync the multiplexer, and
    /// return the record with its owner back-reference cleared.
    pub fn unregister(&mut self, fd: RawFd) -> Result<EventRegistration> {
        let index = self.check_fd(fd)?;
        let Some(mut reg) = self.table[index].take() else {
            return Err(RtError::NotRegistered { fd });
        };
        if let Err(err) = self.mux.unregister(fd) {
            self.table[index] = Some(reg);
            return Err(RtError::Multiplexer(err));
        }
        self.occupied -= 1;
        reg.set_owner(None);
        trace!(fd, "unregistered");
        Ok(reg)
    }

    /// Merge interest bits into an already-registered descriptor and
    /// push the new mask to the multiplexer.
    pub fn add_interest(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
        let index = self.check_fd(fd)?;
        let reg = self.table[index]
            .as_mut()
            .ok_or(RtError::NotRegistered { fd })?;
        reg.set_interest(reg.interest() | mask);
        let interest = reg.interest();
        self.mux.modify(fd, interest).map_err(RtError::Multiplexer)
    }

    /// Clear interest bits; the registration stays in the table even if
    /// the mask becomes empty.
    pub fn remove_interest(&mut self, fd: RawFd, mask: EventMask) -> Result<()> {
        let index = self.check_fd(fd)?;
        let reg = self.table[index]
            .as_mut()
            .ok_or(RtError::NotRegistered { fd })?;
        reg.set_interest(reg.interest() & !mask);
        let interest = reg.interest();
        self.mux.modify(fd, interest).map_err(RtError::Multiplexer)
    }

    /// Bulk register. On failure the already-inserted records are
    /// rolled back so a partially parked wait set never lingers.
    pub fn register_list(&mut self, regs: Vec<EventRegistration>) -> Result<()> {
        let mut inserted: Vec<RawFd> = Vec::with_capacity(regs.len());
        for reg in regs {
            let fd = reg.fd();
            if let Err(err) = self.register(reg) {
                for done in inserted {
                    let _ = self.unregister(done);
                }
                return Err(err);
            }
            inserted.push(fd);
        }
        Ok(())
    }

    /// Bulk unregister. Tolerates descriptors already gone (the batch
    /// may overlap a teardown earlier in the same dispatch cycle).
    pub fn unregister_list(&mut self, fds: &[RawFd]) {
        for &fd in fds {
            match self.unregister(fd) {
                Ok(_) | Err(RtError::NotRegistered { .. }) => {}
                Err(err) => warn!(fd, %err, "unregister failed during teardown"),
            }
        }
    }

    /// The parking primitive. Registers the wait set, links the
    /// descriptors into the thread's waiter list, records the absolute
    /// deadline (None = no deadline), and transitions the thread to
    /// Blocked. The caller yields to the scheduler immediately after.
    pub fn schedule(
        &mut self,
        threads: &mut Threads,
        id: ThreadId,
        waits: &[WaitSpec],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if waits.is_empty() && timeout.is_none() {
            return Err(RtError::EmptyPark);
        }
        let regs: Vec<EventRegistration> = waits
            .iter()
            .map(|w| {
                let mut reg = EventRegistration::new(w.fd, w.interest, crate::event::EventKind::Park);
                reg.set_owner(Some(id));
                reg
            })
            .collect();
        self.register_list(regs)?;
        threads.set_waiters(id, waits.iter().map(|w| w.fd));
        let deadline = timeout.map(|t| Instant::now() + t);
        trace!(strand = id.index(), waits = waits.len(), ?timeout, "parked");
        threads.block(id, deadline);
        Ok(())
    }

    /// One blocking wait/dispatch cycle: the sole blocking point of the
    /// runtime. Returns the number of threads made Runnable.
    ///
    /// The wait bound is the minimum of the poll ceiling and the time
    /// remaining until the nearest pending deadline, so no Blocked
    /// thread is held past its deadline by more than one wait
    /// granularity. EINTR is retried transparently; any other
    /// multiplexer failure is fatal and propagates.
    pub fn dispatch(&mut self, threads: &mut Threads) -> Result<usize> {
        if self.closed {
            return Err(RtError::DispatcherClosed);
        }

        let now = Instant::now();
        let mut timeout = self.poll_ceiling;
        if let Some(deadline) = threads.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }

        self.ready.clear();
        loop {
            match self.mux.wait(Some(timeout), &mut self.ready) {
                Ok(()) => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(RtError::Multiplexer(err)),
            }
        }

        let mut woken = 0;
        let events = std::mem::take(&mut self.ready);
        for ev in &events {
            let Some(reg) = self.table.get_mut(ev.fd as usize).and_then(|s| s.as_mut()) else {
                // The registration was torn down earlier in this batch
                // (a thread parked on several descriptors woke on the
                // first). A report for a descriptor that was never
                // registered would be a defect, but the two cases are
                // indistinguishable here.
                trace!(fd = ev.fd, "ready descriptor with no registration");
                continue;
            };
            reg.set_received(ev.ready);

            let mut wake_target = None;
            if ev.ready.contains(EventMask::READABLE) {
                wake_target = reg.on_input().or(wake_target);
            }
            if ev.ready.contains(EventMask::WRITABLE) {
                wake_target = reg.on_output().or(wake_target);
            }
            if ev.ready.contains(EventMask::HANGUP) {
                wake_target = reg.on_hangup().or(wake_target);
            }

            if let Some(id) = wake_target {
                if self.wake_from_io(threads, id, *ev) {
                    woken += 1;
                }
            }
        }
        self.ready = events;

        // Deadline path: threads whose deadline elapsed with no event
        // are woken independently, waiter lists torn down first.
        let now = Instant::now();
        while let Some(id) = threads.pop_due(now) {
            let fds = threads.take_waiters(id);
            self.unregister_list(&fds);
            if threads.wake(id, Ok(WakeReason::TimedOut)) {
                trace!(strand = id.index(), "woke on deadline");
                woken += 1;
            }
        }

        Ok(woken)
    }

    /// Blocked -> Runnable via the notification path. The waiter list
    /// is torn down before the thread re-enters Runnable, preventing
    /// double registration. Idempotent against a racing repeat firing.
    fn wake_from_io(&mut self, threads: &mut Threads, id: ThreadId, ev: ReadyEvent) -> bool {
        if !threads.is_blocked(id) {
            return false;
        }
        let fds = threads.take_waiters(id);
        self.unregister_list(&fds);
        let woke = threads.wake(
            id,
            Ok(WakeReason::Io {
                fd: ev.fd,
                ready: ev.ready,
            }),
        );
        if woke {
            trace!(strand = id.index(), fd = ev.fd, ready = ?ev.ready, "woke on event");
        }
        woke
    }

    /// Unregister everything and mark the instance unusable. Owner
    /// back-references die with the records, so nothing can dispatch
    /// into a freed table.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for fd in 0..self.capacity as RawFd {
            if self.table[fd as usize].is_some() {
                match self.unregister(fd) {
                    Ok(_) | Err(RtError::NotRegistered { .. }) => {}
                    Err(err) => warn!(fd, %err, "unregister failed during close"),
                }
            }
        }
        self.closed = true;
        trace!("dispatcher closed");
    }
}
