//! Utility functions shared across seatwarden
//!
//! Common helpers that don't fit in specialized modules.

pub mod cmdline;
pub mod fd;
pub mod users;

pub use cmdline::{quote_arg, split_command_line};
pub use users::{PasswdDb, UserDb, UserRecord};
