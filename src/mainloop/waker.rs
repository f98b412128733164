//! Cross-thread wakeup for the event loop

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::utils::fd;

/// Pipe that helper threads write to after queueing a channel message
#[derive(Debug)]
pub struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (read, write) = fd::pipe()?;
        Ok(Self { read, write })
    }

    /// Wake the loop. A full pipe already guarantees a wakeup.
    pub fn wake(&self) {
        let _ = fd::write(self.write.as_raw_fd(), &[1]);
    }

    /// Clear pending wakeups (call before draining the channel)
    pub fn drain(&self) {
        fd::drain(self.read.as_raw_fd());
    }

    /// Descriptor to register with [`super::EventLoop::watch_fd`]
    pub fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}
