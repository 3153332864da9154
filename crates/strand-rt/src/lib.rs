// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! strand-rt: cooperative lightweight-thread runtime with integrated
//! I/O readiness dispatch.
//!
//! Many logical threads of execution (strands) share one carrier,
//! blocking transparently on descriptors or timers. Strands within one
//! runtime instance never execute in parallel; suspension happens only
//! at explicit yield/park calls.
//!
//! Components:
//! - `event`      — per-descriptor interest/readiness records + hooks
//! - `mux`        — OS readiness-multiplexer contract, epoll backend
//! - `dispatcher` — descriptor table + blocking wait/dispatch loop
//! - `thread`     — cooperative thread state machine + arena
//! - `switch`     — opaque suspend/resume context-switch primitive
//! - `scheduler`  — the carrier loop (`Runtime`)
//! - `config`     — explicit runtime configuration
//! - `error`      — error taxonomy

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod mux;
pub mod scheduler;
pub mod switch;
pub mod thread;

pub use config::RuntimeConfig;
pub use dispatcher::EventDispatcher;
pub use error::{Result, RtError};
pub use event::{EventKind, EventMask, EventRegistration, WaitSpec};
pub use scheduler::Runtime;
pub use switch::{StrandCtl, WakeReason};
pub use thread::{ThreadId, ThreadKind, ThreadState};
