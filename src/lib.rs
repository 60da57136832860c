//! Tether: a client library for remote process debugging.
//!
//! The [`session`] module owns the connection to a debug agent and the
//! client-side state machine (targets, jobs, threads, breakpoints,
//! filters); [`protocol`] is the wire surface; [`trace`] layers syscall
//! interception on top of the session. The `tet` and `tet-trace`
//! binaries are thin front ends over this library.

pub mod cfg;
pub mod protocol;
pub mod session;
pub mod trace;
