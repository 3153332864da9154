// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime: the carrier loop tying threads, dispatcher, and stacks
//! together.
//!
//! One carrier executes the scheduler per runtime instance. Runnable
//! strands are resumed FIFO; when none is Runnable the loop enters the
//! dispatcher's blocking wait. Control flow for a parking strand:
//! resume -> strand posts a park request and suspends -> `schedule`
//! registers its wait set and blocks it -> a later dispatch cycle (or
//! the deadline) wakes it back to Runnable.

use std::time::Duration;

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::switch::{StrandCtl, SwitchReason};
use crate::thread::{ThreadId, ThreadKind, Threads};

pub struct Runtime {
    threads: Threads,
    dispatcher: EventDispatcher,
    running: Option<ThreadId>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Ok(Self {
            threads: Threads::new(),
            dispatcher: EventDispatcher::new(&config)?,
            running: None,
        })
    }

    /// Spawn a worker strand. Workers keep `run` alive until they die.
    pub fn spawn<F>(&mut self, entry: F) -> Result<ThreadId>
    where
        F: FnOnce(&StrandCtl) + Send + 'static,
    {
        self.threads.insert(ThreadKind::Worker, Box::new(entry))
    }

    /// Spawn a daemon strand: scheduled like a worker but never keeps
    /// the runtime alive on its own.
    pub fn spawn_daemon<F>(&mut self, entry: F) -> Result<ThreadId>
    where
        F: FnOnce(&StrandCtl) + Send + 'static,
    {
        self.threads.insert(ThreadKind::Daemon, Box::new(entry))
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    /// The strand currently Running, if the carrier is inside one.
    pub fn running(&self) -> Option<ThreadId> {
        self.running
    }

    pub fn set_poll_ceiling(&mut self, ceiling: Duration) {
        self.dispatcher.set_poll_ceiling(ceiling);
    }

    /// Run the carrier loop until no live worker strand remains.
    /// A persistent multiplexer failure propagates from here.
    pub fn run(&mut self) -> Result<()> {
        while self.threads.live_workers() > 0 {
            while let Some(id) = self.threads.next_runnable() {
                self.resume_one(id);
            }
            if self.threads.live_workers() == 0 {
                break;
            }
            self.dispatcher.dispatch(&mut self.threads)?;
        }
        trace!("no live worker strands; carrier loop exits");
        Ok(())
    }

    fn resume_one(&mut self, id: ThreadId) {
        self.running = Some(id);
        let reason = self.threads.resume(id);
        self.running = None;

        match reason {
            None => debug_assert!(false, "resumed missing thread {}", id.index()),
            Some(SwitchReason::Yielded) => self.threads.make_runnable(id),
            Some(SwitchReason::Finished) => self.threads.finish(id),
            Some(SwitchReason::Parked(req)) => {
                if let Err(err) =
                    self.dispatcher
                        .schedule(&mut self.threads, id, &req.waits, req.timeout)
                {
                    // Recoverable: the strand observes the failure as
                    // its park outcome and stays Runnable.
                    debug!(strand = id.index(), %err, "park rejected");
                    self.threads.fail_park(id, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtError;
    use crate::event::{EventMask, WaitSpec};
    use crate::switch::WakeReason;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn runtime() -> Runtime {
        let mut config = RuntimeConfig::with_capacity(1024);
        config.poll_ceiling = Duration::from_millis(20);
        Runtime::new(config).unwrap()
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn strands_interleave_on_yield() {
        let mut rt = runtime();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let order = order.clone();
            rt.spawn(move |ctl| {
                order.lock().unwrap().push(format!("{name}1"));
                ctl.yield_now();
                order.lock().unwrap().push(format!("{name}2"));
            })
            .unwrap();
        }
        rt.run().unwrap();

        let order = order.lock().unwrap();
        assert_eq!(*order, vec!["a1", "b1", "a2", "b2"], "FIFO interleave");
    }

    #[test]
    fn sleep_wakes_via_timeout_path() {
        let mut rt = runtime();
        let elapsed = Arc::new(Mutex::new(None));
        let e = elapsed.clone();
        rt.spawn(move |ctl| {
            let start = Instant::now();
            ctl.sleep(Duration::from_millis(50)).unwrap();
            *e.lock().unwrap() = Some(start.elapsed());
        })
        .unwrap();
        rt.run().unwrap();

        let elapsed = elapsed.lock().unwrap().unwrap();
        assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "woke late: {elapsed:?}");
    }

    #[test]
    fn park_wakes_when_descriptor_becomes_readable() {
        let mut rt = runtime();
        let (rd, wr) = pipe();
        let outcome = Arc::new(Mutex::new(None));

        let o = outcome.clone();
        rt.spawn(move |ctl| {
            let got = ctl.wait_readable(rd, Some(Duration::from_secs(5)));
            *o.lock().unwrap() = Some(got);
        })
        .unwrap();

        rt.spawn(move |ctl| {
            // Let the reader park first.
            ctl.yield_now();
            unsafe {
                libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1);
            }
        })
        .unwrap();

        rt.run().unwrap();

        let got = outcome.lock().unwrap().take().unwrap().unwrap();
        match got {
            WakeReason::Io { fd, ready } => {
                assert_eq!(fd, rd);
                assert!(ready.contains(EventMask::READABLE));
            }
            other => panic!("expected I/O wake, got {other:?}"),
        }
        assert!(rt.dispatcher().is_empty(), "no leaked registration");
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn park_timeout_unregisters_the_wait_set() {
        let mut rt = runtime();
        let (rd, wr) = pipe();
        let outcome = Arc::new(Mutex::new(None));

        let o = outcome.clone();
        rt.spawn(move |ctl| {
            let start = Instant::now();
            let got = ctl.wait_readable(rd, Some(Duration::from_millis(50)));
            *o.lock().unwrap() = Some((got, start.elapsed()));
        })
        .unwrap();

        rt.run().unwrap();

        let (got, elapsed) = outcome.lock().unwrap().take().unwrap();
        assert_eq!(got.unwrap(), WakeReason::TimedOut);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200));
        assert!(rt.dispatcher().is_empty(), "timed-out wait leaked a registration");
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn two_ready_registrations_wake_both_threads_in_one_cycle() {
        let mut rt = runtime();
        let (rd_a, wr_a) = pipe();
        let (rd_b, wr_b) = pipe();
        let woken = Arc::new(AtomicUsize::new(0));

        for rd in [rd_a, rd_b] {
            let woken = woken.clone();
            rt.spawn(move |ctl| {
                ctl.wait_readable(rd, Some(Duration::from_secs(5))).unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        rt.spawn(move |ctl| {
            ctl.yield_now();
            // Both become readable before the next dispatch cycle.
            unsafe {
                libc::write(wr_a, b"x".as_ptr() as *const libc::c_void, 1);
                libc::write(wr_b, b"x".as_ptr() as *const libc::c_void, 1);
            }
        })
        .unwrap();

        rt.run().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 2);
        close_fd(rd_a);
        close_fd(wr_a);
        close_fd(rd_b);
        close_fd(wr_b);
    }

    #[test]
    fn park_on_many_descriptors_wakes_on_first_and_leaks_nothing() {
        let mut rt = runtime();
        let (rd_a, wr_a) = pipe();
        let (rd_b, wr_b) = pipe();
        let outcome = Arc::new(Mutex::new(None));

        let o = outcome.clone();
        rt.spawn(move |ctl| {
            let got = ctl.park(
                vec![WaitSpec::readable(rd_a), WaitSpec::readable(rd_b)],
                Some(Duration::from_secs(5)),
            );
            *o.lock().unwrap() = Some(got);
        })
        .unwrap();

        rt.spawn(move |ctl| {
            ctl.yield_now();
            unsafe {
                libc::write(wr_b, b"x".as_ptr() as *const libc::c_void, 1);
            }
        })
        .unwrap();

        rt.run().unwrap();

        let got = outcome.lock().unwrap().take().unwrap().unwrap();
        assert!(matches!(got, WakeReason::Io { fd, .. } if fd == rd_b));
        assert!(rt.dispatcher().is_empty(), "sibling wait leaked");
        close_fd(rd_a);
        close_fd(wr_a);
        close_fd(rd_b);
        close_fd(wr_b);
    }

    #[test]
    fn park_with_out_of_range_descriptor_is_recoverable() {
        let mut rt = runtime();
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        let capacity = rt.dispatcher().capacity() as RawFd;
        rt.spawn(move |ctl| {
            let got = ctl.wait_readable(capacity, Some(Duration::from_secs(1)));
            *o.lock().unwrap() = Some(got);
        })
        .unwrap();
        rt.run().unwrap();

        let got = outcome.lock().unwrap().take().unwrap();
        assert!(matches!(got, Err(RtError::DescriptorOutOfRange { .. })));
    }

    #[test]
    fn blocked_daemon_does_not_keep_runtime_alive() {
        let mut rt = runtime();
        let finished = Arc::new(AtomicUsize::new(0));

        rt.spawn_daemon(|ctl| {
            let _ = ctl.sleep(Duration::from_secs(600));
        })
        .unwrap();

        let f = finished.clone();
        rt.spawn(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        rt.run().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn panicking_strand_is_contained() {
        let mut rt = runtime();
        let survived = Arc::new(AtomicUsize::new(0));

        rt.spawn(|_| panic!("boom")).unwrap();
        let s = survived.clone();
        rt.spawn(move |ctl| {
            ctl.yield_now();
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        rt.run().unwrap();
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exactly_one_hook_firing_per_event() {
        // Scenario from the dispatch contract: one readable descriptor,
        // one parked strand, dispatch(<= 1s) wakes it exactly once.
        let mut rt = runtime();
        rt.set_poll_ceiling(Duration::from_millis(1000));
        let (rd, wr) = pipe();
        let wakes = Arc::new(AtomicUsize::new(0));

        let w = wakes.clone();
        rt.spawn(move |ctl| {
            ctl.wait_readable(rd, Some(Duration::from_secs(5))).unwrap();
            w.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        unsafe {
            libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let start = Instant::now();
        rt.run().unwrap();
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        close_fd(rd);
        close_fd(wr);
    }
}
