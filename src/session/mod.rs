//! User session
//!
//! A [`Session`] binds one opened [`AuthSession`] to the session leader
//! process forked for it. When the supervisor reports the leader's exit the
//! session writes the pid into its seat's notification pipe.

mod child;

use std::os::fd::{AsRawFd, OwnedFd};

use log::{debug, info, warn};
use nix::unistd::{fork, ForkResult, Pid};
use zeroize::Zeroizing;

use crate::auth::{AuthEvent, AuthSession};
use crate::config::SeatConfig;
use crate::context::SeatContext;
use crate::error::{Error, Result};
use crate::mainloop::ChildStatus;
use crate::utils::fd;

use child::ChildPlan;

/// Who to log in and how
#[derive(Default)]
pub struct SessionRequest {
    pub service: String,
    pub username: String,
    pub password: Option<Zeroizing<String>>,
    /// Extra variables, applied in order before the standard ones
    pub environment: Vec<(String, String)>,
}

pub struct Session {
    seat_id: String,
    auth: AuthSession,
    pid: Pid,
    notify: OwnedFd,
    exit_status: Option<ChildStatus>,
}

impl Session {
    /// Authenticate, open the session and fork the session leader
    ///
    /// Nothing is forked unless authentication and session open succeed.
    pub fn new(
        request: SessionRequest,
        seat_id: &str,
        settings: &SeatConfig,
        notify: OwnedFd,
        ctx: &mut SeatContext<'_>,
    ) -> Result<Self> {
        if request.service.is_empty() {
            return Err(Error::InvalidInput("no auth service".into()));
        }
        if request.username.is_empty() {
            return Err(Error::InvalidInput("no user name".into()));
        }
        let user = ctx
            .services
            .users
            .lookup(&request.username)
            .ok_or_else(|| Error::InvalidInput(format!("unknown user {}", request.username)))?;

        let mut auth = AuthSession::new(&request.service, &request.username, request.password);
        let label = format!("{}/{}", seat_id, request.username);
        auth.connect(move |event| match event {
            AuthEvent::AuthError(reason) => warn!("{}: authentication failed: {}", label, reason),
            AuthEvent::CredentialError(reason) => warn!("{}: credentials failed: {}", label, reason),
            AuthEvent::SessionError(reason) => warn!("{}: session failed: {}", label, reason),
            AuthEvent::AuthSuccess => debug!("{}: authenticated", label),
            AuthEvent::SessionOpened(id) => debug!("{}: session {} opened", label, id),
        });

        for (key, value) in &request.environment {
            auth.putenv(key, value);
        }
        auth.set_search_path(&settings.session_path);
        auth.putenv("XDG_SEAT", seat_id);
        if let Some(vtnr) = settings.vtnr {
            auth.putenv("XDG_VTNR", &vtnr.to_string());
        }
        if let Some(tty) = &settings.tty {
            auth.set_tty(tty);
        }

        auth.start(ctx.services)?;

        let groups = ctx.services.users.supplementary_groups(&user);
        let plan = ChildPlan::build(&user, &groups, settings, &auth.environment())?;

        // SAFETY: the child branch only runs ChildPlan::run, which execs or exits
        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => plan.run(),
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => return Err(Error::ProcessError(format!("fork failed: {}", e))),
        };

        info!(
            "Started session for {} on {} (pid {}, service {})",
            request.username, seat_id, pid, request.service
        );
        ctx.supervisor.adopt(pid, ctx.event_loop);

        Ok(Self {
            seat_id: seat_id.to_string(),
            auth,
            pid,
            notify,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn username(&self) -> &str {
        self.auth.username()
    }

    pub fn service(&self) -> &str {
        self.auth.service()
    }

    pub fn seat_id(&self) -> &str {
        &self.seat_id
    }

    /// Broker session id
    pub fn session_id(&self) -> Option<&str> {
        self.auth.session_id()
    }

    pub fn exit_status(&self) -> Option<ChildStatus> {
        self.exit_status
    }

    /// Start terminating the session leader; exit is observed later
    pub fn terminate(&self, ctx: &mut SeatContext<'_>) -> Result<()> {
        info!("Terminating session for {} (pid {})", self.username(), self.pid);
        ctx.supervisor.stop(self.pid, ctx.event_loop)
    }

    /// Record the leader's exit and notify the seat through its pipe
    pub fn notify_exit(&mut self, status: ChildStatus) {
        self.exit_status = Some(status);
        match fd::write(self.notify.as_raw_fd(), &self.pid.as_raw().to_ne_bytes()) {
            Ok(n) if n == std::mem::size_of::<i32>() => {}
            Ok(_) => warn!("Seat notification pipe full, pid {} dropped", self.pid),
            Err(e) => warn!("Failed to notify seat {}: {}", self.seat_id, e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Session for {} on {} released", self.username(), self.seat_id);
    }
}
