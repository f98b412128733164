//! Global constants for seatwarden
//!
//! Consolidates timing, path, and environment defaults
//! to eliminate magic numbers throughout the codebase.

use std::time::Duration;

// ============================================================================
// Timing Constants
// ============================================================================

/// Default delay between termination signals (HUP -> TERM -> KILL)
pub const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 3;

/// Upper bound on a single poll() while children are watched
///
/// Child exits are also re-checked on every wakeup, so an exit whose SIGCHLD
/// byte was consumed elsewhere is still seen within this interval.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long the main thread waits for a reply from the login broker thread
pub const BROKER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the daemon waits for the broker thread to connect
pub const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Paths
// ============================================================================

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/seatwarden/config.toml";

/// Environment variable overriding the configuration path
pub const CONFIG_ENV_VAR: &str = "SEATWARDEN_CONFIG";

/// Control socket used by seatwarden-client
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/seatwarden/control";

// ============================================================================
// Session Defaults
// ============================================================================

/// Auth service used when neither the request nor the seat names one
pub const DEFAULT_PAM_SERVICE: &str = "seatwarden";

/// Default user name template (%S = seat number, %I = seat id)
pub const DEFAULT_USER_TEMPLATE: &str = "guest%S";

/// PATH exported into every session
pub const DEFAULT_SESSION_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Session bootstrap used when the user has no login shell
pub const FALLBACK_SESSION_CMD: &str = "systemd --user";

/// XDG_SESSION_CLASS exported into every session
pub const SESSION_CLASS: &str = "user";

/// Exit status of a forked child whose exec failed
pub const EXEC_FAILED_STATUS: i32 = 127;

// ============================================================================
// Control Protocol
// ============================================================================

/// Longest request line accepted on the control socket
pub const MAX_CONTROL_REQUEST: usize = 4096;

// ============================================================================
// gumd Accounts Service
// ============================================================================

/// Bus name of the gumd user management daemon
pub const GUMD_SERVICE: &str = "org.O1.SecurityAccounts.gUserManagement";

/// gumd user service object
pub const GUMD_USER_SERVICE_PATH: &str = "/org/O1/SecurityAccounts/gUserManagement/UserService";

/// gumd user object interface
pub const GUMD_USER_INTERFACE: &str = "org.O1.SecurityAccounts.gUserManagement.User";

/// gumd `usertype` value for guest accounts
pub const GUMD_USERTYPE_GUEST: u16 = 3;
