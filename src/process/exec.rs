//! Fork-safe exec preparation
//!
//! Argument and environment arrays are built in the parent. After fork the
//! child only touches the prepared pointers and calls raw syscalls.

use std::ffi::CString;
use std::ptr;

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, SigSet, Signal};

use crate::constants::EXEC_FAILED_STATUS;
use crate::error::{Error, Result};

/// Signals the daemon or launcher routes or ignores
const RESET_SIGNALS: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGPIPE,
    Signal::SIGHUP,
    Signal::SIGCHLD,
    Signal::SIGUSR1,
];

fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidInput(format!("embedded NUL in {:?}", s)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Program, argv and optional envp ready for exec
pub struct ExecPlan {
    program: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Option<Vec<*const libc::c_char>>,
}

impl ExecPlan {
    /// Run `argv[0]` (searched in PATH) with the inherited environment
    pub fn new(argv: &[String]) -> Result<Self> {
        let program = argv
            .first()
            .ok_or_else(|| Error::InvalidInput("empty argument vector".into()))?;
        Self::build(program, argv, None)
    }

    /// Run `program` with an explicit argv (argv[0] may differ) and environment
    pub fn with_env(program: &str, argv: &[String], env: &[(String, String)]) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::InvalidInput("empty argument vector".into()));
        }
        Self::build(program, argv, Some(env))
    }

    fn build(program: &str, argv: &[String], env: Option<&[(String, String)]>) -> Result<Self> {
        let program = to_cstring(program)?;
        let argv = argv
            .iter()
            .map(|a| to_cstring(a))
            .collect::<Result<Vec<_>>>()?;
        let argv_ptrs = null_terminated(&argv);

        let (envp, envp_ptrs) = match env {
            Some(vars) => {
                let envp = vars
                    .iter()
                    .map(|(k, v)| to_cstring(&format!("{}={}", k, v)))
                    .collect::<Result<Vec<_>>>()?;
                let ptrs = null_terminated(&envp);
                (envp, Some(ptrs))
            }
            None => (Vec::new(), None),
        };

        Ok(Self {
            program,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
        })
    }

    /// Replace the current process image. Only returns on failure.
    pub fn exec(&self) -> Errno {
        // SAFETY: every pointer refers to a CString owned by self
        unsafe {
            match &self.envp_ptrs {
                Some(envp) => {
                    libc::execvpe(self.program.as_ptr(), self.argv_ptrs.as_ptr(), envp.as_ptr())
                }
                None => libc::execvp(self.program.as_ptr(), self.argv_ptrs.as_ptr()),
            };
        }
        Errno::last()
    }
}

/// Restore default dispositions and unblock them (child side of fork)
pub fn reset_child_signals() {
    let mut set = SigSet::empty();
    for sig in RESET_SIGNALS {
        // SAFETY: SIG_DFL installs no handler
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
        set.add(sig);
    }
    let _ = set.thread_unblock();
}

/// Write a fixed message to stderr (child side of fork)
pub fn child_log(msg: &[u8]) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Terminate the forked child without running parent cleanup
pub fn exit_child(status: i32) -> ! {
    unsafe { libc::_exit(status) }
}

/// exec the plan or exit the child with [`EXEC_FAILED_STATUS`]
pub fn exec_or_exit(plan: &ExecPlan) -> ! {
    let _ = plan.exec();
    child_log(b"seatwarden: exec failed\n");
    exit_child(EXEC_FAILED_STATUS)
}
