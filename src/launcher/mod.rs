//! Launcher script interpreter
//!
//! Runs helper processes for a session from a small line-based script:
//!
//! ```text
//! # comment
//! M <command>        launch and monitor
//! L <command>        launch as leader (its exit stops everything else)
//! W <path>[,<path>]  wait until every path exists before continuing
//! ```
//!
//! Once the last supervised process is gone the launcher finishes, and
//! optionally signals its own process group.
//!
//! A launcher may also listen on a per-session control socket
//! ([`control_socket_path`]) taking `launch`, `stop` and `list` requests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::{getuid, Pid};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};

use crate::control::{ControlServer, Request, Response};
use crate::error::{Error, Result};
use crate::mainloop::{ignore_signal, Event, EventLoop, Token, Waker};
use crate::process::{terminate_process_group, ProcessEvent, ProcessSupervisor, SupervisorPolicy};

/// Re-check interval for waited-on files (covers directories that don't exist yet)
const WAIT_RECHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Launch { command: String, leader: bool },
    WaitFor(Vec<PathBuf>),
}

/// Parse one script line. Blank lines, comments and unknown controls give None.
pub fn parse_line(line: &str) -> Option<Directive> {
    let line = line.trim();
    let mut chars = line.chars();
    let control = chars.next()?;
    if control == '#' {
        return None;
    }
    let arg = chars.as_str().trim();

    match control {
        'M' => Some(Directive::Launch {
            command: arg.to_string(),
            leader: false,
        }),
        'L' => Some(Directive::Launch {
            command: arg.to_string(),
            leader: true,
        }),
        'W' => {
            let paths: Vec<PathBuf> = arg
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
            if paths.is_empty() {
                warn!("Ignoring wait without paths");
                return None;
            }
            Some(Directive::WaitFor(paths))
        }
        other => {
            warn!("Ignoring unknown control '{}' for command '{}'", other, arg);
            None
        }
    }
}

pub fn parse_script(script: &str) -> Vec<Directive> {
    script.lines().filter_map(parse_line).collect()
}

/// Control socket of a session's launcher: `<runtime dir>/<session id>`
///
/// Without a runtime dir `/run/user/<uid>` is used, and without a session
/// id the launcher's pid names the socket.
pub fn control_socket_path(runtime_dir: Option<&str>, session_id: Option<&str>) -> Result<PathBuf> {
    let name = match session_id {
        Some(id) => {
            if id.is_empty() || id == "." || id == ".." || id.contains('/') {
                return Err(Error::InvalidInput(format!("invalid session id: {:?}", id)));
            }
            id.to_string()
        }
        None => std::process::id().to_string(),
    };
    let dir = match runtime_dir.filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(format!("/run/user/{}", getuid())),
    };
    Ok(dir.join(name))
}

/// Watches the parent directories of files the script waits for
pub struct FileWaiter {
    paths: Vec<PathBuf>,
    _watcher: Option<RecommendedWatcher>,
}

impl FileWaiter {
    /// Wake `waker` whenever something is created next to a waited path
    ///
    /// Directories that can't be watched are covered by the periodic
    /// re-check in the launcher loop.
    pub fn new(paths: Vec<PathBuf>, waker: Arc<Waker>) -> Self {
        let watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
            if let Ok(event) = res {
                use notify::EventKind;
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    waker.wake();
                }
            }
        });

        let watcher = match watcher {
            Ok(mut watcher) => {
                let mut dirs: Vec<&Path> = paths.iter().filter_map(|p| p.parent()).collect();
                dirs.sort();
                dirs.dedup();
                for dir in dirs {
                    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                        debug!("Cannot watch {}: {}", dir.display(), e);
                    }
                }
                Some(watcher)
            }
            Err(e) => {
                warn!("File watcher unavailable, polling instead: {}", e);
                None
            }
        };

        Self {
            paths,
            _watcher: watcher,
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_complete(&self) -> bool {
        self.paths.iter().all(|p| p.exists())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LauncherOptions {
    pub terminate_timeout: Duration,
    /// SIGINT our own process group when finishing
    pub signal_group_on_exit: bool,
}

pub struct Launcher {
    directives: VecDeque<Directive>,
    supervisor: ProcessSupervisor,
    event_loop: EventLoop,
    waker: Arc<Waker>,
    waker_token: Token,
    waiter: Option<FileWaiter>,
    options: LauncherOptions,
    control: Option<ControlServer>,
    launched: usize,
    finished: bool,
}

impl Launcher {
    pub fn new(directives: Vec<Directive>, options: LauncherOptions) -> Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let waker = Arc::new(Waker::new()?);
        let waker_token = event_loop.watch_fd(waker.as_raw_fd());
        let supervisor = ProcessSupervisor::new(SupervisorPolicy {
            exit_when_empty: true,
            terminate_timeout: options.terminate_timeout,
        });

        Ok(Self {
            directives: directives.into(),
            supervisor,
            event_loop,
            waker,
            waker_token,
            waiter: None,
            options,
            control: None,
            launched: 0,
            finished: false,
        })
    }

    /// Serve control requests on `path` until the launcher finishes
    ///
    /// A listening launcher stays up with an empty script, waiting for
    /// helpers to be launched over the socket.
    pub fn listen(&mut self, path: &Path) -> Result<()> {
        let server = ControlServer::bind(path, &mut self.event_loop)?;
        self.control = Some(server);
        Ok(())
    }

    pub fn control_path(&self) -> Option<&Path> {
        self.control.as_ref().map(ControlServer::path)
    }

    /// Route TERM/HUP into the loop, ignore INT, and process the script
    /// up to the first unsatisfied wait
    pub fn start(&mut self) -> Result<()> {
        ignore_signal(Signal::SIGINT)?;
        self.event_loop.handle_signal(Signal::SIGTERM)?;
        self.event_loop.handle_signal(Signal::SIGHUP)?;
        self.resume();
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_waiting(&self) -> bool {
        self.waiter.is_some()
    }

    /// Processes currently supervised
    pub fn running(&self) -> usize {
        self.supervisor.len()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Run until the last process is gone or a stop signal arrives
    pub fn run(&mut self) -> Result<()> {
        while !self.finished {
            self.run_once(None)?;
        }
        Ok(())
    }

    pub fn run_once(&mut self, limit: Option<Duration>) -> Result<()> {
        let limit = match (&self.waiter, limit) {
            (Some(_), Some(l)) => Some(l.min(WAIT_RECHECK_INTERVAL)),
            (Some(_), None) => Some(WAIT_RECHECK_INTERVAL),
            (None, l) => l,
        };
        let events = self.event_loop.wait(limit)?;
        for event in events {
            if self.finished {
                break;
            }
            self.dispatch(event);
        }
        if !self.finished && self.waiter.as_ref().is_some_and(FileWaiter::is_complete) {
            self.resume();
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Signal(sig) => {
                info!("Received {}, stopping all processes", sig);
                self.shutdown();
            }
            Event::Readable(token) if token == self.waker_token => self.waker.drain(),
            Event::Readable(token) if self.control.as_ref().is_some_and(|c| c.owns(token)) => {
                self.handle_control(token);
            }
            Event::Readable(_) => {}
            Event::ChildExited { .. } | Event::Timer(_) => {
                self.supervisor.handle_event(&event, &mut self.event_loop);
                self.handle_process_events();
            }
        }
    }

    /// Continue the script after a satisfied wait (or from the start)
    fn resume(&mut self) {
        if let Some(waiter) = &self.waiter {
            if !waiter.is_complete() {
                return;
            }
            debug!("Files ready: {:?}", waiter.paths());
            self.waiter = None;
        }

        while let Some(directive) = self.directives.pop_front() {
            match directive {
                Directive::Launch { command, leader } => {
                    match self.supervisor.launch(&command, leader, &mut self.event_loop) {
                        Ok(pid) => {
                            self.launched += 1;
                            debug!("Launched {} as pid {}{}", command, pid, if leader { " (leader)" } else { "" });
                        }
                        Err(e) => error!("Failed to launch {:?}: {}", command, e),
                    }
                }
                Directive::WaitFor(paths) => {
                    let waiter = FileWaiter::new(paths, Arc::clone(&self.waker));
                    if !waiter.is_complete() {
                        info!("Waiting for {:?}", waiter.paths());
                        self.waiter = Some(waiter);
                        return;
                    }
                }
            }
        }

        // Nothing was ever started, so no exit will come to end the run
        if self.launched == 0 && self.control.is_none() {
            info!("Script launched no processes");
            self.finish();
        }
    }

    fn handle_control(&mut self, token: Token) {
        let Some(control) = self.control.as_mut() else {
            return;
        };
        let requests = control.poll(token, &mut self.event_loop);

        for (client, request) in requests {
            let response = match request {
                Ok(request) => Response::from(self.execute(request)),
                Err(e) => Response::Error(e.to_string()),
            };
            if let Some(control) = self.control.as_mut() {
                control.respond(client, &response, &mut self.event_loop);
            }
        }
        self.handle_process_events();
    }

    fn execute(&mut self, request: Request) -> Result<Option<String>> {
        match request {
            Request::Launch { command, leader } => {
                let pid = self.supervisor.launch(&command, leader, &mut self.event_loop)?;
                self.launched += 1;
                info!("Control: launched {} as pid {}", command, pid);
                Ok(Some(pid.to_string()))
            }
            Request::Stop { pid } => {
                let pid = Pid::from_raw(pid);
                if !self.supervisor.is_tracked(pid) {
                    return Err(Error::InvalidInput(format!("no process with pid {}", pid)));
                }
                info!("Control: stopping pid {}", pid);
                self.supervisor.stop(pid, &mut self.event_loop)?;
                Ok(None)
            }
            Request::List => Ok(Some(self.process_list())),
            Request::Login { .. } | Request::Switch { .. } | Request::Logout { .. } | Request::Seats => {
                Err(Error::InvalidInput("seat requests go to the daemon".into()))
            }
        }
    }

    /// `pid:command` entries by pid, separated by `; `
    fn process_list(&self) -> String {
        let mut pids = self.supervisor.pids();
        pids.sort_by_key(|pid| pid.as_raw());
        pids.iter()
            .filter_map(|pid| self.supervisor.get(*pid))
            .map(|record| {
                let command = record.command.as_deref().unwrap_or("?");
                if record.is_leader {
                    format!("{}:{} (leader)", record.pid, command)
                } else {
                    format!("{}:{}", record.pid, command)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn handle_process_events(&mut self) {
        for event in self.supervisor.take_events() {
            match event {
                ProcessEvent::Empty => {
                    info!("Last process gone");
                    self.finish();
                }
                ProcessEvent::Stuck { pid } => error!("pid {} could not be terminated", pid),
                ProcessEvent::Stopped { .. } | ProcessEvent::Signalled { .. } => {}
            }
        }
    }

    /// Stop every process (blocking) and finish
    pub fn shutdown(&mut self) {
        self.directives.clear();
        self.waiter = None;
        self.supervisor.stop_all_blocking(&mut self.event_loop);
        self.supervisor.take_events();
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(mut control) = self.control.take() {
            control.shutdown(&mut self.event_loop);
        }
        if self.options.signal_group_on_exit {
            terminate_process_group();
        }
    }
}
