//! seatwarden - multi-seat login and session manager for Linux
//!
//! Architecture:
//! ```text
//! Manager ── owns ──> Seat (per seat id) ── owns ──> Session ── owns ──> AuthSession
//!    │                                                  │
//!    ├── EventLoop (poll: signals, child exit, timers, fds)
//!    └── ProcessSupervisor (pid table + termination ladder)
//! ```
//!
//! Seat state lives on one thread. Signals and child exits reach the event
//! loop through self-pipes; the logind connection and auth plugins run
//! elsewhere and hand messages over a channel plus a [`mainloop::Waker`].

pub mod auth;
pub mod broker;
pub mod config;
pub mod constants;
pub mod context;
pub mod control;
pub mod error;
pub mod launcher;
pub mod mainloop;
pub mod manager;
pub mod plugins;
pub mod process;
pub mod seat;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
