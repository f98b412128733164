//! Process-wide signal self-pipe
//!
//! The handler only writes the signal number as one byte into a
//! non-blocking pipe. Everything else happens when the event loop reads it.

use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::utils::fd;

static READ_FD: AtomicI32 = AtomicI32::new(-1);
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static INIT: Once = Once::new();

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    // SAFETY: write(2) and errno access are async-signal-safe
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let byte = signo as u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *errno = saved;
    }
}

/// Read end of the signal pipe, created on first use
pub(super) fn read_fd() -> io::Result<RawFd> {
    let mut error = None;
    INIT.call_once(|| match fd::pipe() {
        Ok((read, write)) => {
            READ_FD.store(read.into_raw_fd(), Ordering::SeqCst);
            WRITE_FD.store(write.into_raw_fd(), Ordering::SeqCst);
        }
        Err(e) => error = Some(e),
    });
    if let Some(e) = error {
        return Err(e);
    }
    match READ_FD.load(Ordering::SeqCst) {
        fd if fd >= 0 => Ok(fd),
        _ => Err(io::Error::new(io::ErrorKind::Other, "signal pipe unavailable")),
    }
}

/// Route a signal into the self-pipe
pub(super) fn install(sig: Signal) -> io::Result<()> {
    read_fd()?;
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics and write(2)
    unsafe { sigaction(sig, &action) }.map_err(io::Error::from)?;
    Ok(())
}

/// Ignore a signal entirely
pub fn ignore(sig: Signal) -> io::Result<()> {
    // SAFETY: SIG_IGN installs no Rust code
    unsafe { signal(sig, SigHandler::SigIgn) }.map_err(io::Error::from)?;
    Ok(())
}

/// Signals delivered since the last call
pub(super) fn drain(read: RawFd) -> Vec<Signal> {
    let mut signals = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match fd::read(read, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => signals.extend(
                buf[..n]
                    .iter()
                    .filter_map(|&b| Signal::try_from(b as libc::c_int).ok()),
            ),
        }
    }
    signals
}
