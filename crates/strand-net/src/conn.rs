// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking stream connection.
//!
//! Emulated blocking I/O: each operation tries the syscall first, and
//! on EAGAIN parks the calling strand on the descriptor's readiness
//! with the remaining deadline. From the caller's perspective the call
//! blocks; the carrier keeps scheduling other strands meanwhile.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use strand_rt::{StrandCtl, WakeReason};
use tracing::trace;

use crate::action::NetError;

/// Set a file descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A stream socket owned by the connection layer.
///
/// Closing is explicit and idempotent; drop closes as a backstop.
/// Reusing an OS descriptor for a new connection before its prior
/// registration is gone from the dispatcher is a caller hazard.
pub struct StreamConn {
    fd: RawFd,
    peer: Option<SocketAddr>,
}

impl StreamConn {
    /// Take ownership of `fd`, switching it to non-blocking mode.
    pub fn from_fd(fd: RawFd) -> io::Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self { fd, peer: None })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    /// Read whatever is available, parking until the descriptor turns
    /// readable. Returns 0 on EOF. `timeout` bounds the whole call.
    pub fn recv_some(
        &self,
        ctl: &StrandCtl,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, NetError> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                trace!(fd = self.fd, n, "recv");
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
            self.park_until(ctl, deadline, Readiness::Read)?;
        }
    }

    /// Write the whole buffer, parking on writability for partial
    /// writes. `timeout` bounds the whole call.
    pub fn send_all(
        &self,
        ctl: &StrandCtl,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<(), NetError> {
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    buf[sent..].as_ptr() as *const libc::c_void,
                    buf.len() - sent,
                )
            };
            if n > 0 {
                sent += n as usize;
                continue;
            }
            if n == 0 {
                return Err(NetError::Protocol("zero-length write".into()));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
            self.park_until(ctl, deadline, Readiness::Write)?;
        }
        trace!(fd = self.fd, sent, "sent");
        Ok(())
    }

    fn park_until(
        &self,
        ctl: &StrandCtl,
        deadline: Instant,
        readiness: Readiness,
    ) -> Result<(), NetError> {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(NetError::TimedOut);
        };
        let woke = match readiness {
            Readiness::Read => ctl.wait_readable(self.fd, Some(remaining))?,
            Readiness::Write => ctl.wait_writable(self.fd, Some(remaining))?,
        };
        match woke {
            WakeReason::TimedOut => Err(NetError::TimedOut),
            // Hang-up falls through: the retried syscall reports EOF or
            // the error itself.
            WakeReason::Io { .. } => Ok(()),
        }
    }

    /// Close the socket. Idempotent.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

enum Readiness {
    Read,
    Write,
}

impl Drop for StreamConn {
    fn drop(&mut self) {
        self.close();
    }
}
