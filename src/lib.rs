#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! # nshd
//!
//! Shell daemon for peers on an address-based encrypted overlay message bus.
//!
//! Authorized principals send JSON envelopes to the daemon's address; the
//! daemon runs the command synchronously (reply in place), asynchronously
//! (result sent back as a separate message), or feeds it into a persistent
//! PTY shell owned by that principal whose output is streamed back.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          clap CLI, tracing init, first-run bootstrap, `addr` subcommand
//! config.rs        TOML + env-var configuration
//! identity.rs      wallet file (sealed seed), address derivation
//! auth.rs          authorized principals registry, hot reload
//! protocol.rs      wire envelope (CommandRequest) and replies (CommandResponse)
//! dispatch.rs      validation gates and routing of inbound messages
//! daemon.rs        wiring: transport, registry, sessions, dispatcher, liveness
//! liveness.rs      heartbeats, self-probe keepalive, forced probe, escalation
//! shell/
//!   process.rs     one-shot exec with uid/gid and timeout
//!   pty.rs         PTY allocation, spawn, resize
//! sessions/
//!   buffer.rs      pending output awaiting flush
//!   session.rs     one PTY shell bound to a principal, flush loop
//!   mod.rs         SessionManager (one session per principal)
//! transport/
//!   mod.rs         overlay bus contract (Transport, Connection, ClientFactory)
//!   relay.rs       WebSocket relay client aggregating several connections
//! ```

pub mod auth;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod identity;
pub mod liveness;
pub mod protocol;
pub mod sessions;
pub mod shell;
pub mod transport;
pub mod util;

pub use auth::AuthorizationRegistry;
pub use config::Config;
pub use dispatch::Dispatcher;
pub use identity::Identity;
pub use sessions::SessionManager;
