// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! OS readiness multiplexer.
//!
//! The dispatcher is written against the `Multiplexer` contract only;
//! `Epoll` is the Linux backend. Level-triggered.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::EventMask;

/// One readiness report from a multiplexer wait.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub ready: EventMask,
}

/// Contract consumed by the dispatcher: one backend per OS facility.
pub trait Multiplexer: Send {
    /// Add a descriptor with the given interest mask.
    fn register(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()>;

    /// Replace the interest mask of an already-added descriptor.
    fn modify(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()>;

    /// Remove a descriptor. Tolerates descriptors the OS already forgot
    /// (closed fds drop out of epoll on their own).
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` (`None` = indefinitely) and append the
    /// ready descriptors to `out`. EINTR is returned to the caller,
    /// which retries.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()>;
}

/// Batch size for a single wait.
const MAX_EVENTS: usize = 64;

fn mask_to_epoll(mask: EventMask) -> u32 {
    let mut events = 0u32;
    if mask.contains(EventMask::READABLE) {
        events |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventMask::WRITABLE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_mask(events: u32) -> EventMask {
    let mut mask = EventMask::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        mask |= EventMask::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask |= EventMask::WRITABLE;
    }
    if events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        mask |= EventMask::HANGUP;
    }
    mask
}

/// Round up to whole milliseconds so a deadline is never undershot by
/// sub-millisecond truncation.
fn timeout_ms(timeout: Duration) -> i32 {
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    ms.min(i32::MAX as u128) as i32
}

/// Linux epoll backend.
pub struct Epoll {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: EventMask) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask_to_epoll(mask),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Multiplexer for Epoll {
    fn register(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    fn modify(&mut self, fd: RawFd, mask: EventMask) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the fd was already closed.
            if err.raw_os_error() != Some(libc::ENOENT)
                && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadyEvent>) -> io::Result<()> {
        let ms = timeout.map(timeout_ms).unwrap_or(-1);
        let n = unsafe {
            libc::epoll_wait(self.epfd, self.buf.as_mut_ptr(), self.buf.len() as i32, ms)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for ev in &self.buf[..n as usize] {
            out.push(ReadyEvent {
                fd: ev.u64 as RawFd,
                ready: epoll_to_mask(ev.events),
            });
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn wait_reports_readable_pipe() {
        let mut mux = Epoll::new().unwrap();
        let (rd, wr) = pipe();
        mux.register(rd, EventMask::READABLE).unwrap();

        unsafe {
            libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut out = Vec::new();
        mux.wait(Some(Duration::from_millis(100)), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fd, rd);
        assert!(out[0].ready.contains(EventMask::READABLE));

        mux.unregister(rd).unwrap();
        close(rd);
        close(wr);
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let mut mux = Epoll::new().unwrap();
        let mut out = Vec::new();
        mux.wait(Some(Duration::from_millis(1)), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unregister_tolerates_closed_fd() {
        let mut mux = Epoll::new().unwrap();
        let (rd, wr) = pipe();
        mux.register(rd, EventMask::READABLE).unwrap();
        close(rd);
        close(wr);
        // Kernel already dropped the closed fd; this must not error.
        mux.unregister(rd).unwrap();
    }

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(timeout_ms(Duration::from_millis(50)), 50);
        assert_eq!(timeout_ms(Duration::ZERO), 0);
    }
}
