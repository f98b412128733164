//! Session leader setup in the forked child
//!
//! [`ChildPlan`] is built in the parent. [`ChildPlan::run`] runs between
//! fork and exec and only performs raw syscalls on prepared data.

use std::ffi::CString;

use nix::unistd::{getegid, geteuid, setgid, setgroups, setsid, setuid, Gid, Uid};

use crate::config::SeatConfig;
use crate::constants::FALLBACK_SESSION_CMD;
use crate::error::{Error, Result};
use crate::process::exec::{child_log, exec_or_exit, exit_child, reset_child_signals, ExecPlan};
use crate::utils::{split_command_line, UserRecord};

struct Identity {
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

pub(crate) struct ChildPlan {
    tty: Option<CString>,
    /// None when we already run as the target user
    identity: Option<Identity>,
    home: Option<CString>,
    exec: ExecPlan,
}

/// argv for the session leader: `-shell` login form, `-c cmd` when a
/// session command is configured, the bootstrap command without a shell
pub(crate) fn session_argv(shell: &str, session_cmd: Option<&str>) -> (String, Vec<String>) {
    if shell.is_empty() {
        let argv = split_command_line(session_cmd.unwrap_or(FALLBACK_SESSION_CMD));
        let program = argv.first().cloned().unwrap_or_default();
        return (program, argv);
    }

    let base = shell.rsplit('/').next().unwrap_or(shell);
    let mut argv = vec![format!("-{}", base)];
    if let Some(cmd) = session_cmd {
        argv.push("-c".to_string());
        argv.push(cmd.to_string());
    }
    (shell.to_string(), argv)
}

impl ChildPlan {
    pub(crate) fn build(
        user: &UserRecord,
        groups: &[u32],
        settings: &SeatConfig,
        environment: &[(String, String)],
    ) -> Result<Self> {
        let (program, argv) = session_argv(&user.shell, settings.session_cmd.as_deref());
        if program.is_empty() {
            return Err(Error::InvalidInput("empty session command".into()));
        }
        let exec = ExecPlan::with_env(&program, &argv, environment)?;

        let identity = if geteuid().as_raw() == user.uid && getegid().as_raw() == user.gid {
            None
        } else {
            Some(Identity {
                uid: Uid::from_raw(user.uid),
                gid: Gid::from_raw(user.gid),
                groups: groups.iter().map(|&g| Gid::from_raw(g)).collect(),
            })
        };

        let tty = match &settings.tty {
            Some(tty) => Some(
                CString::new(tty.as_str())
                    .map_err(|_| Error::InvalidInput(format!("bad tty path {:?}", tty)))?,
            ),
            None => None,
        };
        let home = CString::new(user.home.to_string_lossy().as_bytes()).ok();

        Ok(Self {
            tty,
            identity,
            home,
            exec,
        })
    }

    /// Child side of fork. Never returns.
    pub(crate) fn run(&self) -> ! {
        reset_child_signals();

        if setsid().is_err() {
            child_log(b"seatwarden: setsid failed\n");
        }
        if let Some(tty) = &self.tty {
            if !attach_tty(tty) {
                child_log(b"seatwarden: no controlling terminal, continuing without\n");
            }
        }
        if let Some(identity) = &self.identity {
            if drop_privileges(identity).is_err() {
                child_log(b"seatwarden: failed to drop privileges\n");
                exit_child(1);
            }
        }
        if let Some(home) = &self.home {
            unsafe {
                libc::chdir(home.as_ptr());
            }
        }
        exec_or_exit(&self.exec)
    }
}

/// Groups, then gid, then uid; then make sure root can't be regained
fn drop_privileges(identity: &Identity) -> nix::Result<()> {
    setgroups(&identity.groups)?;
    setgid(identity.gid)?;
    setuid(identity.uid)?;
    if !identity.uid.is_root() && setuid(Uid::from_raw(0)).is_ok() {
        return Err(nix::errno::Errno::EPERM);
    }
    Ok(())
}

fn attach_tty(path: &CString) -> bool {
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return false;
        }
        if libc::ioctl(fd, libc::TIOCSCTTY, 0) < 0 {
            libc::close(fd);
            return false;
        }
        for target in 0..=2 {
            libc::dup2(fd, target);
        }
        if fd > 2 {
            libc::close(fd);
        }
    }
    true
}
