//! Error taxonomy shared by the session lifecycle engine

use nix::errno::Errno;
use thiserror::Error;

/// Errors returned by seat, session and supervisor operations
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed arguments, rejected before any syscall
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Credentials rejected by the auth stack
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Authenticated, but credentials or session registration failed
    #[error("session open failed: {0}")]
    SessionOpenFailure(String),

    /// fork/exec/signal failures
    #[error("process error: {0}")]
    ProcessError(String),

    /// Request referencing a seat that is not in the seat table
    #[error("seat not ready: {0}")]
    SeatNotReady(String),

    /// Process survived the whole termination ladder
    #[error("process {0} did not terminate after SIGKILL")]
    StuckProcess(i32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::ProcessError(errno.desc().to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
