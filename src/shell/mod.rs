//! Shell process management.
//!
//! Two modes of shell interaction:
//!
//! - **One-shot** ([`process::exec_command`]): run a command through
//!   `/bin/sh -c`, capture output, return. Used for synchronous requests and
//!   for asynchronous chat or sessionless requests.
//! - **Interactive** ([`pty::spawn_shell_pty`]): a long-lived shell on a PTY,
//!   owned by a [`crate::sessions::Session`].
//!
//! Both accept an optional uid/gid taken from the caller's authorization entry.

pub mod process;
pub mod pty;
