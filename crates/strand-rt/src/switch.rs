// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Context-switch primitive.
//!
//! Opaque suspend/resume backed by the native thread-parking facility:
//! each strand owns a dedicated stack, and a strict gate handoff
//! guarantees that at any instant either the carrier or exactly one
//! strand is executing. Suspension happens only at explicit
//! `yield_now`/`park` calls; there is no preemption. Everything above
//! this module sees only `Stack::resume` and the `StrandCtl` switch
//! calls.

use std::any::Any;
use std::panic::{catch_unwind, panic_any, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use std::os::unix::io::RawFd;

use crate::error::{Result, RtError};
use crate::event::{EventMask, WaitSpec};
use crate::thread::ThreadId;

/// Why a strand handed control back to the carrier.
pub(crate) enum SwitchReason {
    /// Voluntary non-blocking yield; still Runnable.
    Yielded,
    /// Wants to block on the given wait set and/or deadline.
    Parked(ParkRequest),
    /// Entry function returned; the stack is recyclable.
    Finished,
}

/// Wait set a parking strand hands to the dispatcher.
pub(crate) struct ParkRequest {
    pub waits: Vec<WaitSpec>,
    pub timeout: Option<Duration>,
}

/// What ended a park, as observed by the parked strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A registration fired; `ready` is the received mask.
    Io { fd: RawFd, ready: EventMask },
    /// The deadline elapsed with no event.
    TimedOut,
}

/// Panic payload used to unwind a strand out of user code when the
/// runtime is torn down while the strand is suspended.
struct StrandShutdown;

enum GateSignal {
    Waiting,
    Open,
    Shutdown,
}

/// One direction of the carrier/strand handoff.
struct Gate {
    state: Mutex<GateSignal>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateSignal::Waiting),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.state.lock().unwrap() = GateSignal::Open;
        self.cv.notify_one();
    }

    fn shutdown(&self) {
        *self.state.lock().unwrap() = GateSignal::Shutdown;
        self.cv.notify_all();
    }

    /// Block until opened. Returns false on shutdown.
    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                GateSignal::Open => {
                    *state = GateSignal::Waiting;
                    return true;
                }
                GateSignal::Shutdown => return false,
                GateSignal::Waiting => state = self.cv.wait(state).unwrap(),
            }
        }
    }
}

type WakeSlot = Arc<Mutex<Option<Result<WakeReason>>>>;

/// Opaque execution-stack handle. Identity equals the owning thread id.
pub struct Stack {
    id: ThreadId,
    /// Strand waits here for the carrier to resume it.
    resume: Arc<Gate>,
    /// Carrier waits here for the strand to switch back.
    back: Arc<Gate>,
    reason: Arc<Mutex<Option<SwitchReason>>>,
    wake: WakeSlot,
    join: Option<JoinHandle<()>>,
}

impl Stack {
    /// Create a suspended stack running `entry` on first resume.
    pub(crate) fn spawn(
        id: ThreadId,
        entry: Box<dyn FnOnce(&StrandCtl) + Send + 'static>,
    ) -> Result<Self> {
        let resume = Arc::new(Gate::new());
        let back = Arc::new(Gate::new());
        let reason = Arc::new(Mutex::new(None));
        let wake: WakeSlot = Arc::new(Mutex::new(None));

        let ctl = StrandCtl {
            id,
            resume: resume.clone(),
            back: back.clone(),
            reason: reason.clone(),
            wake: wake.clone(),
        };

        let join = std::thread::Builder::new()
            .name(format!("strand-{}", id.index()))
            .spawn(move || strand_main(ctl, entry))
            .map_err(RtError::Spawn)?;

        Ok(Self {
            id,
            resume,
            back,
            reason,
            wake,
            join: Some(join),
        })
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    /// Switch the carrier into this strand. Returns once the strand
    /// suspends again, with the reason it switched back.
    pub(crate) fn resume(&mut self) -> SwitchReason {
        self.resume.open();
        self.back.wait();
        let reason = self.reason.lock().unwrap().take();
        debug_assert!(
            reason.is_some(),
            "strand {} handed control back without a switch reason",
            self.id.index()
        );
        reason.unwrap_or(SwitchReason::Finished)
    }

    /// Deliver the park outcome the strand will observe on resume.
    /// First delivery wins; a spurious repeat is a no-op.
    pub(crate) fn deliver_wake(&self, outcome: Result<WakeReason>) {
        let mut slot = self.wake.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    /// Join a stack whose strand has already finished.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }

    /// Tear down a strand that will never be resumed again. If it is
    /// suspended inside the runtime, it unwinds out of user code.
    pub(crate) fn close(&mut self) {
        self.resume.shutdown();
        self.join();
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.close();
    }
}

fn strand_main(ctl: StrandCtl, entry: Box<dyn FnOnce(&StrandCtl) + Send + 'static>) {
    // Stay suspended until the scheduler resumes us the first time.
    if !ctl.resume.wait() {
        return;
    }

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| entry(&ctl))) {
        if payload.downcast_ref::<StrandShutdown>().is_some() {
            // Runtime teardown unwound us mid-suspend; the carrier is
            // not waiting on the back gate.
            return;
        }
        tracing::error!(
            strand = ctl.id.index(),
            "strand panicked: {}",
            panic_message(&payload)
        );
    }

    *ctl.reason.lock().unwrap() = Some(SwitchReason::Finished);
    ctl.back.open();
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// In-strand surface handed to the entry function. All methods suspend
/// the calling strand; from its perspective a park behaves like a real
/// blocking call.
pub struct StrandCtl {
    id: ThreadId,
    resume: Arc<Gate>,
    back: Arc<Gate>,
    reason: Arc<Mutex<Option<SwitchReason>>>,
    wake: WakeSlot,
}

impl StrandCtl {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    fn switch_out(&self, reason: SwitchReason) {
        *self.reason.lock().unwrap() = Some(reason);
        self.back.open();
        if !self.resume.wait() {
            panic_any(StrandShutdown);
        }
    }

    /// Voluntary non-blocking yield back to the scheduler.
    pub fn yield_now(&self) {
        self.switch_out(SwitchReason::Yielded);
    }

    /// Block until one of `waits` fires or `timeout` elapses. A park
    /// with neither is rejected (it would never wake).
    pub fn park(&self, waits: Vec<WaitSpec>, timeout: Option<Duration>) -> Result<WakeReason> {
        if waits.is_empty() && timeout.is_none() {
            return Err(RtError::EmptyPark);
        }
        self.switch_out(SwitchReason::Parked(ParkRequest { waits, timeout }));
        let outcome = self.wake.lock().unwrap().take();
        debug_assert!(
            outcome.is_some(),
            "strand {} resumed from park without an outcome",
            self.id.index()
        );
        outcome.unwrap_or(Ok(WakeReason::TimedOut))
    }

    /// Timed sleep: a park with no wait set.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.park(Vec::new(), Some(duration)).map(|_| ())
    }

    /// Park until `fd` is readable.
    pub fn wait_readable(&self, fd: RawFd, timeout: Option<Duration>) -> Result<WakeReason> {
        self.park(vec![WaitSpec::readable(fd)], timeout)
    }

    /// Park until `fd` is writable.
    pub fn wait_writable(&self, fd: RawFd, timeout: Option<Duration>) -> Result<WakeReason> {
        self.park(vec![WaitSpec::writable(fd)], timeout)
    }
}
