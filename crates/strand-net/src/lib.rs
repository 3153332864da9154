// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! strand-net: connection layer for the strand runtime.
//!
//! Binds socket readiness to parked strands and supplies the four-phase
//! processing contract (encode outgoing, decode incoming, execute
//! business logic, handle error) invoked independently of the scheduler
//! core.
//!
//! Components:
//! - `action`  — four-phase `Action` contract + pipeline driver
//! - `conn`    — non-blocking stream connection parking on readiness
//! - `session` — integer-keyed session registry

pub mod action;
pub mod conn;
pub mod session;

pub use action::{run_action, Action, Decoded, NetError};
pub use conn::{set_nonblocking, StreamConn};
pub use session::{Session, SessionRegistry};
