//! Child process launch and supervision

pub mod exec;
pub mod supervisor;

pub use supervisor::{terminate_process_group, ProcessEvent, ProcessRecord, ProcessSupervisor, SupervisorPolicy};
