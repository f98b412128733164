//! Process supervisor
//!
//! Tracks children by pid and terminates them with an escalation ladder:
//! HUP -> TERM -> KILL for plain children, TERM -> KILL for children that
//! lead their own process group (signalled with killpg). Each step waits
//! for the configured timeout. A record leaves the table exactly once, when
//! the event loop reports the child's exit.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{fork, getpgrp, setpgid, ForkResult, Pid};

use crate::error::{Error, Result};
use crate::mainloop::{ChildStatus, Event, EventLoop, TimerId};
use crate::process::exec::{exec_or_exit, reset_child_signals, ExecPlan};
use crate::utils::split_command_line;

/// Supervisor behaviour switches
#[derive(Debug, Clone, Copy)]
pub struct SupervisorPolicy {
    /// Report [`ProcessEvent::Empty`] once the last tracked process is gone
    pub exit_when_empty: bool,
    /// Delay between escalation steps
    pub terminate_timeout: Duration,
}

/// Notifications produced by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A tracked process exited and was removed from the table
    Stopped { pid: Pid, status: ChildStatus },
    /// A termination signal was sent
    Signalled { pid: Pid, signal: Signal },
    /// The process survived SIGKILL; no further attempts are made
    Stuck { pid: Pid },
    /// The table became empty (only with `exit_when_empty`)
    Empty,
}

/// One tracked child
#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub command: Option<String>,
    /// Signals go to the whole process group
    pub process_group: bool,
    /// Its exit stops every other tracked process
    pub is_leader: bool,
    pub last_signal: Option<Signal>,
    timer: Option<TimerId>,
}

impl ProcessRecord {
    /// True while an escalation step is scheduled
    pub fn escalating(&self) -> bool {
        self.timer.is_some()
    }

    fn first_signal(&self) -> Signal {
        if self.process_group {
            Signal::SIGTERM
        } else {
            Signal::SIGHUP
        }
    }

    fn send(&self, signal: Signal) -> nix::Result<()> {
        if self.process_group {
            killpg(self.pid, signal)
        } else {
            kill(self.pid, signal)
        }
    }
}

fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

pub struct ProcessSupervisor {
    policy: SupervisorPolicy,
    records: HashMap<Pid, ProcessRecord>,
    timers: HashMap<TimerId, Pid>,
    events: VecDeque<ProcessEvent>,
    cascading: bool,
}

impl ProcessSupervisor {
    pub fn new(policy: SupervisorPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            timers: HashMap::new(),
            events: VecDeque::new(),
            cascading: false,
        }
    }

    pub fn set_terminate_timeout(&mut self, timeout: Duration) {
        self.policy.terminate_timeout = timeout;
    }

    /// Fork and exec a command line in its own process group
    pub fn launch(
        &mut self,
        command_line: &str,
        is_leader: bool,
        event_loop: &mut EventLoop,
    ) -> Result<Pid> {
        let argv = split_command_line(command_line);
        if argv.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty command line: {:?}",
                command_line
            )));
        }
        let plan = ExecPlan::new(&argv)?;

        // SAFETY: the child only resets signals, calls setpgid and execs
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                reset_child_signals();
                let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                exec_or_exit(&plan)
            }
            Ok(ForkResult::Parent { child }) => {
                // Also done in the child; whichever runs first wins
                if let Err(e) = setpgid(child, child) {
                    debug!("setpgid({}) from parent: {}", child, e);
                }
                info!("Launched pid {}: {}", child, command_line);
                self.insert(child, Some(command_line.to_string()), true, is_leader, event_loop);
                Ok(child)
            }
            Err(e) => Err(Error::ProcessError(format!("fork failed: {}", e))),
        }
    }

    /// Track a child forked elsewhere (signalled individually, not a leader)
    pub fn adopt(&mut self, pid: Pid, event_loop: &mut EventLoop) {
        self.insert(pid, None, false, false, event_loop);
    }

    fn insert(
        &mut self,
        pid: Pid,
        command: Option<String>,
        process_group: bool,
        is_leader: bool,
        event_loop: &mut EventLoop,
    ) {
        event_loop.watch_child(pid);
        self.records.insert(
            pid,
            ProcessRecord {
                pid,
                command,
                process_group,
                is_leader,
                last_signal: None,
                timer: None,
            },
        );
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.records.contains_key(&pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Events produced since the last call
    pub fn take_events(&mut self) -> Vec<ProcessEvent> {
        self.events.drain(..).collect()
    }

    /// Begin the termination ladder. Calling it again while a step is
    /// pending leaves the ladder where it is.
    pub fn stop(&mut self, pid: Pid, event_loop: &mut EventLoop) -> Result<()> {
        let timeout = self.policy.terminate_timeout;
        let record = self
            .records
            .get_mut(&pid)
            .ok_or_else(|| Error::InvalidInput(format!("pid {} is not supervised", pid)))?;

        if record.timer.is_some() {
            debug!("pid {} already terminating", pid);
            return Ok(());
        }
        if !is_alive(pid) {
            debug!("pid {} already gone, nothing to signal", pid);
            return Ok(());
        }

        let signal = record.first_signal();
        if let Err(e) = record.send(signal) {
            warn!("Failed to send {} to {}: {}", signal, pid, e);
        }
        record.last_signal = Some(signal);
        let timer = event_loop.add_timeout(timeout);
        record.timer = Some(timer);
        self.timers.insert(timer, pid);
        self.events.push_back(ProcessEvent::Signalled { pid, signal });
        Ok(())
    }

    /// Escalate after a timeout. Returns false for timers we don't own.
    pub fn handle_timer(&mut self, id: TimerId, event_loop: &mut EventLoop) -> bool {
        let Some(pid) = self.timers.remove(&id) else {
            return false;
        };
        let timeout = self.policy.terminate_timeout;
        let Some(record) = self.records.get_mut(&pid) else {
            return true;
        };
        record.timer = None;

        if !is_alive(pid) {
            return true;
        }

        let next = match record.last_signal {
            Some(Signal::SIGHUP) => Signal::SIGTERM,
            Some(Signal::SIGTERM) => Signal::SIGKILL,
            _ => {
                error!("{}", Error::StuckProcess(pid.as_raw()));
                self.events.push_back(ProcessEvent::Stuck { pid });
                return true;
            }
        };

        info!("pid {} ignored {:?}, sending {}", pid, record.last_signal, next);
        if let Err(e) = record.send(next) {
            warn!("Failed to send {} to {}: {}", next, pid, e);
        }
        record.last_signal = Some(next);
        let timer = event_loop.add_timeout(timeout);
        record.timer = Some(timer);
        self.timers.insert(timer, pid);
        self.events.push_back(ProcessEvent::Signalled { pid, signal: next });
        true
    }

    /// Forget an exited child. Returns false for pids we don't own.
    pub fn handle_child_exit(
        &mut self,
        pid: Pid,
        status: ChildStatus,
        event_loop: &mut EventLoop,
    ) -> bool {
        let Some(record) = self.records.remove(&pid) else {
            return false;
        };
        if let Some(timer) = record.timer {
            event_loop.cancel_timeout(timer);
            self.timers.remove(&timer);
        }
        event_loop.unwatch_child(pid);
        info!("pid {} stopped ({})", pid, status);
        self.events.push_back(ProcessEvent::Stopped { pid, status });

        if record.is_leader && !self.cascading {
            info!("Leader {} exited, stopping remaining processes", pid);
            self.stop_all_blocking(event_loop);
        }

        if self.policy.exit_when_empty && self.records.is_empty() && !self.cascading {
            self.events.push_back(ProcessEvent::Empty);
        }
        true
    }

    /// Route one event from the loop. Returns false if it isn't ours.
    pub fn handle_event(&mut self, event: &Event, event_loop: &mut EventLoop) -> bool {
        match *event {
            Event::ChildExited { pid, status } => self.handle_child_exit(pid, status, event_loop),
            Event::Timer(id) => self.handle_timer(id, event_loop),
            _ => false,
        }
    }

    /// [`stop`](Self::stop), then pump the loop until the process is gone
    /// or the ladder is exhausted
    pub fn stop_blocking(&mut self, pid: Pid, event_loop: &mut EventLoop) -> Result<()> {
        self.stop(pid, event_loop)?;
        self.pump_until(event_loop, |sup| {
            sup.records.get(&pid).map_or(true, |r| r.timer.is_none())
        })
    }

    /// Stop every tracked process and wait for all ladders to resolve
    pub fn stop_all_blocking(&mut self, event_loop: &mut EventLoop) {
        let was_cascading = self.cascading;
        self.cascading = true;

        for pid in self.pids() {
            if let Err(e) = self.stop(pid, event_loop) {
                warn!("Failed to stop {}: {}", pid, e);
            }
        }
        if let Err(e) = self.pump_until(event_loop, |sup| sup.records.values().all(|r| r.timer.is_none())) {
            error!("Event loop failed while stopping processes: {}", e);
        }

        self.cascading = was_cascading;
    }

    /// Pump the loop in place; events that aren't ours are handed back
    fn pump_until(
        &mut self,
        event_loop: &mut EventLoop,
        mut done: impl FnMut(&Self) -> bool,
    ) -> Result<()> {
        let mut deferred = Vec::new();
        let result = loop {
            if done(self) {
                break Ok(());
            }
            match event_loop.wait(None) {
                Ok(events) => {
                    for event in events {
                        if !self.handle_event(&event, event_loop) {
                            deferred.push(event);
                        }
                    }
                }
                Err(e) => break Err(e.into()),
            }
        };
        event_loop.requeue(deferred);
        result
    }
}

/// SIGINT our own process group (launcher exit path)
pub fn terminate_process_group() {
    if let Err(e) = killpg(getpgrp(), Signal::SIGINT) {
        warn!("Failed to signal own process group: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command;
    use std::time::Instant;

    fn supervisor(exit_when_empty: bool) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorPolicy {
            exit_when_empty,
            terminate_timeout: Duration::from_millis(200),
        })
    }

    /// Pump until `count` events satisfy `pred` (10s cap)
    fn collect(
        sup: &mut ProcessSupervisor,
        ev: &mut EventLoop,
        count: usize,
        pred: impl Fn(&ProcessEvent) -> bool,
    ) -> Vec<ProcessEvent> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            seen.extend(sup.take_events());
            if seen.iter().filter(|e| pred(e)).count() >= count {
                break;
            }
            for event in ev.wait(Some(Duration::from_millis(100))).unwrap() {
                sup.handle_event(&event, ev);
            }
        }
        seen.extend(sup.take_events());
        seen
    }

    fn wait_for_file(path: &Path) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(path.exists(), "{} never appeared", path.display());
    }

    /// Pump until `until` matches, stamping each event with the time just
    /// before the call that produced it
    fn collect_stamped(
        sup: &mut ProcessSupervisor,
        ev: &mut EventLoop,
        started: Instant,
        until: impl Fn(&ProcessEvent) -> bool,
    ) -> Vec<(Instant, ProcessEvent)> {
        let mut seen: Vec<(Instant, ProcessEvent)> =
            sup.take_events().into_iter().map(|e| (started, e)).collect();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !seen.iter().any(|(_, e)| until(e)) && Instant::now() < deadline {
            for event in ev.wait(Some(Duration::from_millis(100))).unwrap() {
                let stamp = Instant::now();
                sup.handle_event(&event, ev);
                seen.extend(sup.take_events().into_iter().map(|e| (stamp, e)));
            }
        }
        seen
    }

    /// Spawn a shell that ignores HUP and TERM, outside the supervisor
    fn spawn_stubborn(ready: &Path) -> std::process::Child {
        let script = format!(
            "trap '' HUP TERM; touch {}; while :; do sleep 1; done",
            ready.display()
        );
        Command::new("/bin/sh").args(["-c", &script]).spawn().unwrap()
    }

    fn signals_sent(events: &[ProcessEvent], pid: Pid) -> Vec<Signal> {
        events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Signalled { pid: p, signal } if *p == pid => Some(*signal),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_command_line_rejected() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        assert!(matches!(sup.launch("   ", false, &mut ev), Err(Error::InvalidInput(_))));
        assert!(sup.is_empty());
    }

    #[test]
    fn test_stop_unknown_pid_rejected() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        assert!(matches!(
            sup.stop(Pid::from_raw(i32::MAX - 7), &mut ev),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_group_ladder_term_then_kill() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);

        let cmd = format!(
            "/bin/sh -c 'trap \"\" TERM; touch {}; while :; do sleep 1; done'",
            ready.display()
        );
        let pid = sup.launch(&cmd, false, &mut ev).unwrap();
        wait_for_file(&ready);

        sup.stop(pid, &mut ev).unwrap();
        let events = collect(&mut sup, &mut ev, 1, |e| matches!(e, ProcessEvent::Stopped { .. }));

        assert_eq!(signals_sent(&events, pid), vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert!(events.contains(&ProcessEvent::Stopped {
            pid,
            status: ChildStatus::Signaled(Signal::SIGKILL)
        }));
        assert!(!sup.is_tracked(pid));
    }

    #[test]
    fn test_plain_ladder_hup_term_kill() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);

        let child = spawn_stubborn(&ready);
        let pid = Pid::from_raw(child.id() as i32);
        sup.adopt(pid, &mut ev);
        wait_for_file(&ready);

        let started = Instant::now();
        sup.stop(pid, &mut ev).unwrap();
        let stamped = collect_stamped(&mut sup, &mut ev, started, |e| matches!(e, ProcessEvent::Stopped { .. }));
        let events: Vec<ProcessEvent> = stamped.iter().map(|(_, e)| e.clone()).collect();

        assert_eq!(
            signals_sent(&events, pid),
            vec![Signal::SIGHUP, Signal::SIGTERM, Signal::SIGKILL]
        );

        // Each step waits out the full timeout
        let sent_at: Vec<Instant> = stamped
            .iter()
            .filter(|(_, e)| matches!(e, ProcessEvent::Signalled { .. }))
            .map(|(at, _)| *at)
            .collect();
        for pair in sent_at.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(200),
                "escalated after {:?}",
                pair[1] - pair[0]
            );
        }
    }

    #[test]
    fn test_unkillable_process_reported_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);

        let mut child = spawn_stubborn(&ready);
        let pid = Pid::from_raw(child.id() as i32);
        sup.adopt(pid, &mut ev);
        wait_for_file(&ready);

        // Nobody reaps it, so it lingers as a zombie after SIGKILL
        ev.unwatch_child(pid);

        let started = Instant::now();
        sup.stop(pid, &mut ev).unwrap();
        let stamped = collect_stamped(&mut sup, &mut ev, started, |e| matches!(e, ProcessEvent::Stuck { .. }));
        let events: Vec<ProcessEvent> = stamped.iter().map(|(_, e)| e.clone()).collect();

        assert_eq!(
            signals_sent(&events, pid),
            vec![Signal::SIGHUP, Signal::SIGTERM, Signal::SIGKILL]
        );
        assert_eq!(events.last(), Some(&ProcessEvent::Stuck { pid }));
        let (stuck_at, _) = stamped.last().unwrap();
        assert!(*stuck_at - started >= Duration::from_millis(600));

        // Given up on, but still tracked and no longer escalating
        assert!(sup.is_tracked(pid));
        assert!(!sup.get(pid).unwrap().escalating());
        assert!(!events.iter().any(|e| matches!(e, ProcessEvent::Stopped { .. })));

        child.wait().unwrap();
    }

    #[test]
    fn test_responsive_process_stops_after_first_signal() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        let pid = sup.launch("sleep 30", false, &mut ev).unwrap();

        sup.stop(pid, &mut ev).unwrap();
        // A second stop does not restart the ladder
        sup.stop(pid, &mut ev).unwrap();
        let events = collect(&mut sup, &mut ev, 1, |e| matches!(e, ProcessEvent::Stopped { .. }));

        assert_eq!(signals_sent(&events, pid), vec![Signal::SIGTERM]);
        assert!(sup.is_empty());
    }

    #[test]
    fn test_stop_dead_pid_schedules_nothing() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        let ghost = Pid::from_raw(i32::MAX - 3);
        sup.adopt(ghost, &mut ev);

        sup.stop(ghost, &mut ev).unwrap();
        assert!(!sup.get(ghost).unwrap().escalating());
        assert!(sup.take_events().is_empty());

        // The loop reports the unknown child and the record goes away
        let events = collect(&mut sup, &mut ev, 1, |e| matches!(e, ProcessEvent::Stopped { .. }));
        assert!(events.contains(&ProcessEvent::Stopped {
            pid: ghost,
            status: ChildStatus::Unknown
        }));
    }

    #[test]
    fn test_stop_blocking_waits_for_exit() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        let pid = sup.launch("sleep 30", false, &mut ev).unwrap();

        sup.stop_blocking(pid, &mut ev).unwrap();
        assert!(!sup.is_tracked(pid));
    }

    #[test]
    fn test_leader_exit_cascades() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        let leader = sup.launch("sleep 30", true, &mut ev).unwrap();
        let helper = sup.launch("sleep 30", false, &mut ev).unwrap();

        kill(leader, Signal::SIGKILL).unwrap();
        let events = collect(&mut sup, &mut ev, 2, |e| matches!(e, ProcessEvent::Stopped { .. }));

        let stopped: Vec<Pid> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Stopped { pid, .. } => Some(*pid),
                _ => None,
            })
            .collect();
        assert_eq!(stopped.len(), 2);
        assert_eq!(stopped[0], leader);
        assert!(stopped.contains(&helper));
        assert!(sup.is_empty());
    }

    #[test]
    fn test_exit_when_empty_reports_empty() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(true);
        sup.launch("true", false, &mut ev).unwrap();

        let events = collect(&mut sup, &mut ev, 1, |e| *e == ProcessEvent::Empty);
        assert_eq!(events.last(), Some(&ProcessEvent::Empty));
    }

    #[test]
    fn test_no_empty_event_without_policy() {
        let mut ev = EventLoop::new().unwrap();
        let mut sup = supervisor(false);
        sup.launch("true", false, &mut ev).unwrap();

        let events = collect(&mut sup, &mut ev, 1, |e| matches!(e, ProcessEvent::Stopped { .. }));
        assert!(!events.contains(&ProcessEvent::Empty));
    }
}
