//! Login broker (seat and session directory)
//!
//! The daemon talks to logind through [`logind::LogindBroker`]; tests and
//! other front ends provide their own [`LoginBroker`].

pub mod logind;

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;

use crate::mainloop::Waker;

pub use logind::LogindBroker;

/// A seat as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatInfo {
    pub id: String,
    /// Broker object path (informational)
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatChange {
    Added(SeatInfo),
    Removed(SeatInfo),
}

pub trait LoginBroker {
    /// One-shot enumeration of the current seats
    fn list_seats(&self) -> Result<Vec<SeatInfo>>;

    /// Session id owning `pid`
    fn session_for_pid(&self, pid: u32) -> Result<String>;

    /// Deliver seat changes through the returned channel, calling
    /// `waker.wake()` after each message
    fn subscribe_seat_changes(&self, waker: Arc<Waker>) -> Result<mpsc::Receiver<SeatChange>>;
}
