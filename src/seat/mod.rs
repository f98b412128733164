//! Seat state machine
//!
//! A seat owns at most one [`Session`]. Switching users terminates the
//! current session and creates the next one once the old leader's exit has
//! come back through the seat's notification pipe.
//!
//! ```text
//! Idle --create_session--> Active --switch_user / terminate_session--> Draining
//! Draining --exit notification--> Active (pending switch or auto-login) | Idle
//! ```

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::{debug, info, warn};
use nix::unistd::Pid;
use zeroize::Zeroizing;

use crate::config::SeatConfig;
use crate::context::SeatContext;
use crate::error::{Error, Result};
use crate::mainloop::ChildStatus;
use crate::session::{Session, SessionRequest};
use crate::utils::fd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatState {
    Idle,
    Active,
    Draining,
}

impl fmt::Display for SeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SeatState::Idle => "idle",
            SeatState::Active => "active",
            SeatState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Login request; unset fields fall back to the seat's defaults
#[derive(Default)]
pub struct LoginRequest {
    pub service: Option<String>,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub environment: Vec<(String, String)>,
}

impl LoginRequest {
    pub fn user(service: Option<&str>, username: &str, password: Option<&str>) -> Self {
        Self {
            service: service.map(str::to_string),
            username: Some(username.to_string()),
            password: password.map(|p| Zeroizing::new(p.to_string())),
            environment: Vec::new(),
        }
    }
}

/// Expand a default-user template for `seat_id`
///
/// `%S` is the number after "seat" (0 if there is none), `%I` the seat id.
/// Other `%` sequences are dropped.
pub fn build_user_name(template: &str, seat_id: &str) -> String {
    let mut out = String::with_capacity(template.len() + seat_id.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('S') => {
                let number = seat_id
                    .strip_prefix("seat")
                    .and_then(|n| n.parse::<u32>().ok())
                    .unwrap_or_else(|| {
                        warn!("Seat id {} has no number, using 0", seat_id);
                        0
                    });
                out.push_str(&number.to_string());
            }
            Some('I') => out.push_str(seat_id),
            _ => {}
        }
    }
    out
}

pub struct Seat {
    id: String,
    path: Option<String>,
    settings: SeatConfig,
    session: Option<Session>,
    /// Next identity once the current session is gone (last request wins)
    pending: Option<LoginRequest>,
    draining: bool,
    notify_read: OwnedFd,
    notify_write: OwnedFd,
}

impl Seat {
    pub fn new(id: &str, path: Option<&str>, settings: SeatConfig) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::InvalidInput("empty seat id".into()));
        }
        let (notify_read, notify_write) = fd::pipe()?;
        Ok(Self {
            id: id.to_string(),
            path: path.map(str::to_string),
            settings,
            session: None,
            pending: None,
            draining: false,
            notify_read,
            notify_write,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> &SeatConfig {
        &self.settings
    }

    /// Applies to sessions created from now on
    pub fn set_settings(&mut self, settings: SeatConfig) {
        self.settings = settings;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SeatState {
        match (&self.session, self.draining) {
            (None, _) => SeatState::Idle,
            (Some(_), false) => SeatState::Active,
            (Some(_), true) => SeatState::Draining,
        }
    }

    /// Read end of the notification pipe, for the event loop
    pub fn notify_fd(&self) -> RawFd {
        self.notify_read.as_raw_fd()
    }

    /// Log in on an idle seat
    pub fn create_session(&mut self, request: LoginRequest, ctx: &mut SeatContext<'_>) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::InvalidInput(format!(
                "seat {} already has an active session",
                self.id
            )));
        }

        let service = request
            .service
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.settings.pam_service.clone());
        let username = match request.username.filter(|u| !u.is_empty()) {
            Some(name) => name,
            None => {
                let name = build_user_name(&self.settings.default_user, &self.id);
                self.prepare_user(&name, ctx);
                name
            }
        };

        let notify = self.notify_write.try_clone()?;
        let session_request = SessionRequest {
            service,
            username,
            password: request.password,
            environment: request.environment,
        };

        let session = Session::new(session_request, &self.id, &self.settings, notify, ctx)?;
        info!("Seat {}: {} logged in", self.id, session.username());
        self.session = Some(session);
        self.draining = false;
        Ok(())
    }

    /// Replace the current user; on an idle seat this is [`create_session`](Self::create_session)
    pub fn switch_user(&mut self, request: LoginRequest, ctx: &mut SeatContext<'_>) -> Result<()> {
        if self.session.is_none() {
            return self.create_session(request, ctx);
        }

        // Only queue the request once the current session is on its way out
        self.terminate_session(ctx)?;
        if let Some(previous) = self.pending.replace(request) {
            debug!(
                "Seat {}: switch to {:?} superseded",
                self.id,
                previous.username.as_deref().unwrap_or("<default>")
            );
        }
        Ok(())
    }

    /// Ask the current session to end
    pub fn terminate_session(&mut self, ctx: &mut SeatContext<'_>) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::InvalidInput(format!("seat {} has no session", self.id)))?;
        if self.draining {
            return Ok(());
        }
        // Leader already reaped, its notification is still in the pipe
        if let Some(status) = session.exit_status() {
            debug!("Seat {}: leader {} already exited ({})", self.id, session.pid(), status);
        } else {
            session.terminate(ctx)?;
        }
        self.draining = true;
        Ok(())
    }

    /// Forward a supervisor exit report. Returns true if it was our leader.
    pub fn child_exited(&mut self, pid: Pid, status: ChildStatus) -> bool {
        match self.session.as_mut() {
            Some(session) if session.pid() == pid => {
                session.notify_exit(status);
                true
            }
            _ => false,
        }
    }

    /// Consume exit notifications from the pipe
    ///
    /// With `stopping` no replacement session is started.
    pub fn handle_notify(&mut self, ctx: &mut SeatContext<'_>, stopping: bool) -> SeatState {
        let mut ended = false;
        for pid in self.read_notifications() {
            match &self.session {
                Some(session) if session.pid() == pid => ended = true,
                _ => debug!("Seat {}: stale notification for pid {}", self.id, pid),
            }
        }
        if !ended {
            return self.state();
        }

        if let Some(session) = self.session.take() {
            info!(
                "Seat {}: session for {} ended ({})",
                self.id,
                session.username(),
                session.exit_status().unwrap_or(ChildStatus::Unknown)
            );
        }
        self.draining = false;

        if stopping {
            self.pending = None;
            return self.state();
        }

        let next = match self.pending.take() {
            Some(request) => Some(request),
            None if self.settings.auto_login => {
                info!("Seat {}: auto-login", self.id);
                Some(LoginRequest::default())
            }
            None => None,
        };
        if let Some(request) = next {
            if let Err(e) = self.create_session(request, ctx) {
                warn!("Seat {}: next session failed: {}", self.id, e);
            }
        }
        self.state()
    }

    /// Stop the session synchronously (seat removal)
    pub fn shutdown(&mut self, ctx: &mut SeatContext<'_>) {
        self.pending = None;
        if let Some(session) = &self.session {
            if let Err(e) = ctx.supervisor.stop_blocking(session.pid(), ctx.event_loop) {
                warn!("Seat {}: stopping session failed: {}", self.id, e);
            }
        }
        self.discard_session();
    }

    /// Drop the session without waiting for its process
    pub fn discard_session(&mut self) {
        self.pending = None;
        self.draining = false;
        fd::drain(self.notify_read.as_raw_fd());
        self.session = None;
    }

    fn read_notifications(&self) -> Vec<Pid> {
        let mut pids = Vec::new();
        let mut buf = [0u8; 4];
        while let Ok(4) = fd::read(self.notify_read.as_raw_fd(), &mut buf) {
            pids.push(Pid::from_raw(i32::from_ne_bytes(buf)));
        }
        pids
    }

    /// Give the accounts plugin a chance to provision the default user
    fn prepare_user(&self, name: &str, ctx: &SeatContext<'_>) {
        let Some(accounts) = ctx.services.accounts.as_deref() else {
            return;
        };
        if !accounts.is_valid_user(name) {
            info!("Seat {}: setting up guest user {}", self.id, name);
            if !accounts.setup_guest_user(name) {
                warn!("Seat {}: could not set up {}", self.id, name);
            }
        } else if self.settings.prepare_default && !accounts.cleanup_guest_user(name, false) {
            warn!("Seat {}: could not reset {}", self.id, name);
        }
    }
}
