//! Single-threaded event loop
//!
//! Multiplexes signals (self-pipe), child exits, one-shot timers and
//! readable file descriptors with poll(2). Callers pull a batch of
//! [`Event`]s from [`EventLoop::wait`] and apply them in order; nothing is
//! dispatched from inside a signal handler.

mod signals;
mod waker;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::constants::CHILD_POLL_INTERVAL;

pub use signals::ignore as ignore_signal;
pub use waker::Waker;

/// One-shot timer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Registered file descriptor handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

/// How a watched child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(Signal),
    /// Reaped by someone else before we could collect it
    Unknown,
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exit status {}", code),
            ChildStatus::Signaled(sig) => write!(f, "killed by {}", sig),
            ChildStatus::Unknown => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A handled signal other than SIGCHLD
    Signal(Signal),
    ChildExited { pid: Pid, status: ChildStatus },
    Timer(TimerId),
    Readable(Token),
}

pub struct EventLoop {
    signal_fd: RawFd,
    children: HashSet<Pid>,
    deadlines: BTreeSet<(Instant, TimerId)>,
    timers: HashMap<TimerId, Instant>,
    fds: HashMap<Token, RawFd>,
    pending: VecDeque<Event>,
    next_id: u64,
}

impl EventLoop {
    /// Create a loop and route SIGCHLD into it
    pub fn new() -> io::Result<Self> {
        let signal_fd = signals::read_fd()?;
        signals::install(Signal::SIGCHLD)?;
        Ok(Self {
            signal_fd,
            children: HashSet::new(),
            deadlines: BTreeSet::new(),
            timers: HashMap::new(),
            fds: HashMap::new(),
            pending: VecDeque::new(),
            next_id: 1,
        })
    }

    /// Deliver `sig` as [`Event::Signal`] instead of its default action
    pub fn handle_signal(&mut self, sig: Signal) -> io::Result<()> {
        signals::install(sig)
    }

    /// Report the exit of `pid` as [`Event::ChildExited`]
    pub fn watch_child(&mut self, pid: Pid) {
        self.children.insert(pid);
    }

    pub fn unwatch_child(&mut self, pid: Pid) {
        self.children.remove(&pid);
    }

    pub fn add_timeout(&mut self, after: Duration) -> TimerId {
        let id = TimerId(self.next_id());
        let deadline = Instant::now() + after;
        self.deadlines.insert((deadline, id));
        self.timers.insert(id, deadline);
        id
    }

    /// Returns false if the timer already fired or never existed
    pub fn cancel_timeout(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(deadline) => {
                self.deadlines.remove(&(deadline, id));
                true
            }
            None => false,
        }
    }

    pub fn has_timeout(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn watch_fd(&mut self, fd: RawFd) -> Token {
        let token = Token(self.next_id());
        self.fds.insert(token, fd);
        token
    }

    pub fn unwatch_fd(&mut self, token: Token) {
        self.fds.remove(&token);
    }

    /// Hand events back so the next [`wait`](Self::wait) returns them first
    pub fn requeue(&mut self, events: impl IntoIterator<Item = Event>) {
        self.pending.extend(events);
    }

    /// Block until something happens, or until `limit` elapses
    ///
    /// May return an empty batch (timeout or EINTR).
    pub fn wait(&mut self, limit: Option<Duration>) -> io::Result<Vec<Event>> {
        if !self.pending.is_empty() {
            return Ok(self.pending.drain(..).collect());
        }

        let mut events = Vec::new();
        self.reap_children(&mut events);
        self.expire_timers(&mut events);
        if !events.is_empty() {
            return Ok(events);
        }

        let tokens: Vec<Token> = self.fds.keys().copied().collect();
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(tokens.len() + 1);
        pollfds.push(libc::pollfd {
            fd: self.signal_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for token in &tokens {
            pollfds.push(libc::pollfd {
                fd: self.fds[token],
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout = self.poll_timeout(limit);
        trace!("poll: {} fds, timeout {}ms", pollfds.len(), timeout);
        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        if ret > 0 {
            if pollfds[0].revents & libc::POLLIN != 0 {
                for sig in signals::drain(self.signal_fd) {
                    if sig != Signal::SIGCHLD {
                        debug!("Received {}", sig);
                        events.push(Event::Signal(sig));
                    }
                }
            }
            let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
            for (pollfd, token) in pollfds[1..].iter().zip(&tokens) {
                if pollfd.revents & ready != 0 {
                    events.push(Event::Readable(*token));
                }
            }
        }

        self.reap_children(&mut events);
        self.expire_timers(&mut events);
        Ok(events)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Milliseconds for poll(), -1 for infinite
    fn poll_timeout(&self, limit: Option<Duration>) -> libc::c_int {
        let now = Instant::now();
        let mut timeout = limit;
        if let Some((deadline, _)) = self.deadlines.first() {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }
        if !self.children.is_empty() {
            timeout = Some(timeout.map_or(CHILD_POLL_INTERVAL, |t| t.min(CHILD_POLL_INTERVAL)));
        }
        match timeout {
            // Round up so a timer is never polled for just before it expires
            Some(t) => t
                .as_nanos()
                .div_ceil(1_000_000)
                .min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        }
    }

    fn reap_children(&mut self, events: &mut Vec<Event>) {
        let pids: Vec<Pid> = self.children.iter().copied().collect();
        for pid in pids {
            let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => ChildStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => ChildStatus::Signaled(sig),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!("Child {} was reaped elsewhere", pid);
                    ChildStatus::Unknown
                }
                Err(e) => {
                    warn!("waitpid({}) failed: {}", pid, e);
                    continue;
                }
            };
            debug!("Child {} exited ({})", pid, status);
            self.children.remove(&pid);
            events.push(Event::ChildExited { pid, status });
        }
    }

    fn expire_timers(&mut self, events: &mut Vec<Event>) {
        let now = Instant::now();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, id));
            self.timers.remove(&id);
            events.push(Event::Timer(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Arc;

    fn wait_for(ev: &mut EventLoop, mut pred: impl FnMut(&Event) -> bool) -> Option<Event> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            for event in ev.wait(Some(Duration::from_millis(100))).unwrap() {
                if pred(&event) {
                    return Some(event);
                }
            }
        }
        None
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut ev = EventLoop::new().unwrap();
        let late = ev.add_timeout(Duration::from_millis(60));
        let early = ev.add_timeout(Duration::from_millis(20));

        let mut fired = Vec::new();
        while fired.len() < 2 {
            for event in ev.wait(None).unwrap() {
                if let Event::Timer(id) = event {
                    fired.push(id);
                }
            }
        }
        assert_eq!(fired, vec![early, late]);
        assert!(!ev.has_timeout(early));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut ev = EventLoop::new().unwrap();
        let cancelled = ev.add_timeout(Duration::from_millis(10));
        let kept = ev.add_timeout(Duration::from_millis(40));
        assert!(ev.cancel_timeout(cancelled));
        assert!(!ev.cancel_timeout(cancelled));

        let event = wait_for(&mut ev, |e| matches!(e, Event::Timer(_))).unwrap();
        assert_eq!(event, Event::Timer(kept));
    }

    #[test]
    fn test_child_exit_reported() {
        let mut ev = EventLoop::new().unwrap();
        let child = Command::new("/bin/sh").args(["-c", "exit 7"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        ev.watch_child(pid);

        let event = wait_for(&mut ev, |e| matches!(e, Event::ChildExited { .. })).unwrap();
        assert_eq!(
            event,
            Event::ChildExited {
                pid,
                status: ChildStatus::Exited(7)
            }
        );
    }

    #[test]
    fn test_waker_from_other_thread() {
        let mut ev = EventLoop::new().unwrap();
        let waker = Arc::new(Waker::new().unwrap());
        let token = ev.watch_fd(waker.as_raw_fd());

        let remote = Arc::clone(&waker);
        std::thread::spawn(move || remote.wake()).join().unwrap();

        let event = wait_for(&mut ev, |e| matches!(e, Event::Readable(_))).unwrap();
        assert_eq!(event, Event::Readable(token));
        waker.drain();
    }

    #[test]
    fn test_requeued_events_come_first() {
        let mut ev = EventLoop::new().unwrap();
        let id = ev.add_timeout(Duration::from_secs(60));
        ev.requeue([Event::Timer(id)]);
        assert_eq!(ev.wait(None).unwrap(), vec![Event::Timer(id)]);
    }
}
