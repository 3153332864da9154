// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Four-phase protocol action contract.
//!
//! An action describes one request/response exchange: encode the
//! outgoing message, decode the incoming bytes, execute the business
//! logic, and handle failure. The driver runs the phases over a
//! connection; it knows nothing about the scheduler beyond the
//! `StrandCtl` it parks with.

use std::io;
use std::time::Duration;

use strand_rt::{RtError, StrandCtl};
use thiserror::Error;

use crate::conn::StreamConn;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o failure")]
    Io(#[from] io::Error),

    #[error("operation timed out")]
    TimedOut,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("runtime failure")]
    Runtime(#[from] RtError),
}

/// Outcome of a decode phase over the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A complete message was recognized, consuming this many bytes.
    Complete(usize),
    /// More bytes are required before a message can be recognized.
    NeedMore,
}

/// The four processing phases, invoked in order by the driver.
pub trait Action {
    /// Produce the outgoing message.
    fn encode(&mut self, out: &mut Vec<u8>) -> Result<(), NetError>;

    /// Examine the bytes received so far.
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, NetError>;

    /// Execute the business logic once a complete message arrived.
    fn process(&mut self) -> Result<(), NetError>;

    /// Observe the failure that aborted the exchange.
    fn on_error(&mut self, _err: &NetError) {}
}

/// Drive one exchange: encode, send, receive until decode recognizes a
/// complete message, then process. `timeout` bounds each I/O step. On
/// failure the action's error phase observes the error before it
/// propagates.
pub fn run_action<A: Action>(
    ctl: &StrandCtl,
    conn: &StreamConn,
    action: &mut A,
    timeout: Duration,
) -> Result<(), NetError> {
    let result = drive(ctl, conn, action, timeout);
    if let Err(ref err) = result {
        action.on_error(err);
    }
    result
}

fn drive<A: Action>(
    ctl: &StrandCtl,
    conn: &StreamConn,
    action: &mut A,
    timeout: Duration,
) -> Result<(), NetError> {
    let mut out = Vec::new();
    action.encode(&mut out)?;
    conn.send_all(ctl, &out, timeout)?;

    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = conn.recv_some(ctl, &mut chunk, timeout)?;
        if n == 0 {
            return Err(NetError::Protocol(
                "peer closed before a complete message".into(),
            ));
        }
        received.extend_from_slice(&chunk[..n]);
        match action.decode(&received)? {
            Decoded::Complete(_) => break,
            Decoded::NeedMore => continue,
        }
    }

    action.process()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::RawFd;
    use std::sync::{Arc, Mutex};
    use strand_rt::{Runtime, RuntimeConfig};

    fn runtime() -> Runtime {
        let mut config = RuntimeConfig::with_capacity(1024);
        config.poll_ceiling = Duration::from_millis(20);
        Runtime::new(config).unwrap()
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    /// Sends "ping", expects exactly "pong" back.
    struct PingAction {
        processed: bool,
        failed: Option<String>,
    }

    impl PingAction {
        fn new() -> Self {
            Self {
                processed: false,
                failed: None,
            }
        }
    }

    impl Action for PingAction {
        fn encode(&mut self, out: &mut Vec<u8>) -> Result<(), NetError> {
            out.extend_from_slice(b"ping");
            Ok(())
        }

        fn decode(&mut self, input: &[u8]) -> Result<Decoded, NetError> {
            if input.len() < 4 {
                return Ok(Decoded::NeedMore);
            }
            if &input[..4] == b"pong" {
                Ok(Decoded::Complete(4))
            } else {
                Err(NetError::Protocol("unexpected reply".into()))
            }
        }

        fn process(&mut self) -> Result<(), NetError> {
            self.processed = true;
            Ok(())
        }

        fn on_error(&mut self, err: &NetError) {
            self.failed = Some(err.to_string());
        }
    }

    #[test]
    fn four_phases_run_over_a_live_exchange() {
        let mut rt = runtime();
        let (client_fd, server_fd) = socketpair();
        let state = Arc::new(Mutex::new(None));

        // Server side: read 4 bytes, answer byte by byte so the client
        // decode phase sees a NeedMore round.
        rt.spawn(move |ctl| {
            let conn = StreamConn::from_fd(server_fd).unwrap();
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                got += conn
                    .recv_some(ctl, &mut buf[got..], Duration::from_secs(5))
                    .unwrap();
            }
            assert_eq!(&buf, b"ping");
            conn.send_all(ctl, b"po", Duration::from_secs(5)).unwrap();
            ctl.yield_now();
            conn.send_all(ctl, b"ng", Duration::from_secs(5)).unwrap();
        })
        .unwrap();

        let s = state.clone();
        rt.spawn(move |ctl| {
            let conn = StreamConn::from_fd(client_fd).unwrap();
            let mut action = PingAction::new();
            let result = run_action(ctl, &conn, &mut action, Duration::from_secs(5));
            *s.lock().unwrap() = Some((result.is_ok(), action.processed, action.failed));
        })
        .unwrap();

        rt.run().unwrap();
        let (ok, processed, failed) = state.lock().unwrap().take().unwrap();
        assert!(ok);
        assert!(processed);
        assert!(failed.is_none());
    }

    #[test]
    fn error_phase_observes_peer_close() {
        let mut rt = runtime();
        let (client_fd, server_fd) = socketpair();
        let state = Arc::new(Mutex::new(None));

        rt.spawn(move |ctl| {
            let mut conn = StreamConn::from_fd(server_fd).unwrap();
            let mut buf = [0u8; 16];
            let _ = conn.recv_some(ctl, &mut buf, Duration::from_secs(5));
            conn.close();
        })
        .unwrap();

        let s = state.clone();
        rt.spawn(move |ctl| {
            let conn = StreamConn::from_fd(client_fd).unwrap();
            let mut action = PingAction::new();
            let result = run_action(ctl, &conn, &mut action, Duration::from_secs(5));
            *s.lock().unwrap() = Some((result.is_err(), action.failed.is_some()));
        })
        .unwrap();

        rt.run().unwrap();
        let (errored, observed) = state.lock().unwrap().take().unwrap();
        assert!(errored);
        assert!(observed, "on_error must observe the failure");
    }
}
