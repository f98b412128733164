//! One authenticate -> establish credentials -> open session cycle

use log::{debug, info, warn};
use zeroize::Zeroizing;

use super::{AuthHandle, Conversation};
use crate::constants::{DEFAULT_SESSION_PATH, SESSION_CLASS};
use crate::context::Services;
use crate::error::{Error, Result};

/// Progress of the cycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthState {
    Uninitialized,
    Authenticating,
    Authenticated,
    SessionOpening,
    SessionOpen,
    Closed,
    Error,
}

/// Notifications for listeners attached with [`AuthSession::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    AuthError(String),
    AuthSuccess,
    CredentialError(String),
    /// Carries the broker's session id
    SessionOpened(String),
    SessionError(String),
}

type Listener = Box<dyn FnMut(&AuthEvent)>;

pub struct AuthSession {
    service: String,
    username: String,
    state: AuthState,
    handle: Option<Box<dyn AuthHandle>>,
    /// Variables set before the handle exists, in insertion order
    pending_env: Vec<(String, String)>,
    tty: Option<String>,
    search_path: String,
    secret: Option<Zeroizing<String>>,
    session_id: Option<String>,
    listeners: Vec<Listener>,
}

impl AuthSession {
    pub fn new(service: &str, username: &str, password: Option<Zeroizing<String>>) -> Self {
        Self {
            service: service.to_string(),
            username: username.to_string(),
            state: AuthState::Uninitialized,
            handle: None,
            pending_env: Vec::new(),
            tty: None,
            search_path: DEFAULT_SESSION_PATH.to_string(),
            secret: password,
            session_id: None,
            listeners: Vec::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn connect(&mut self, listener: impl FnMut(&AuthEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Terminal the session will run on (applied when the handle is created)
    pub fn set_tty(&mut self, tty: &str) {
        self.tty = Some(tty.to_string());
    }

    /// PATH exported with the standard variables
    pub fn set_search_path(&mut self, path: &str) {
        self.search_path = path.to_string();
    }

    /// Set a variable in the session environment
    ///
    /// Buffered until the handle exists, then replayed in order.
    pub fn putenv(&mut self, key: &str, value: &str) -> bool {
        if key.is_empty() || key.contains('=') {
            warn!("Rejecting environment variable {:?}", key);
            return false;
        }
        match self.handle.as_mut() {
            Some(handle) => match handle.putenv(key, value) {
                Ok(()) => true,
                Err(e) => {
                    warn!("putenv {} failed: {:#}", key, e);
                    false
                }
            },
            None => {
                self.pending_env.push((key.to_string(), value.to_string()));
                true
            }
        }
    }

    /// Environment for the session process
    pub fn environment(&self) -> Vec<(String, String)> {
        match &self.handle {
            Some(handle) => handle.environment(),
            None => self.pending_env.clone(),
        }
    }

    /// Authenticate, establish credentials and open the session
    ///
    /// Returns the broker's session id. Each failure emits its own event and
    /// leaves the state at [`AuthState::Error`].
    pub fn start(&mut self, services: &Services) -> Result<String> {
        if self.state != AuthState::Uninitialized {
            return Err(Error::InvalidInput(format!(
                "auth session for {} already started",
                self.username
            )));
        }
        self.advance(AuthState::Authenticating);

        let conversation = Conversation::new(self.secret.take().as_deref().map(String::as_str));
        let mut handle = match services.auth.begin(&self.service, &self.username, conversation) {
            Ok(handle) => handle,
            Err(e) => {
                let reason = format!("{:#}", e);
                return Err(self.fail(AuthEvent::AuthError(reason.clone()), Error::AuthFailure(reason)));
            }
        };

        if let Some(tty) = &self.tty {
            if let Err(e) = handle.set_tty(tty) {
                warn!("Could not set tty {}: {:#}", tty, e);
            }
        }
        for (key, value) in self.pending_env.drain(..) {
            if let Err(e) = handle.putenv(&key, &value) {
                warn!("putenv {} failed: {:#}", key, e);
            }
        }

        if let Err(e) = handle.authenticate() {
            let reason = format!("{:#}", e);
            return Err(self.fail(AuthEvent::AuthError(reason.clone()), Error::AuthFailure(reason)));
        }
        self.advance(AuthState::Authenticated);
        debug!("{} authenticated for {}", self.username, self.service);
        self.emit(&AuthEvent::AuthSuccess);

        self.put_standard_env(handle.as_mut(), services);

        if let Err(e) = handle.establish_credentials() {
            let reason = format!("{:#}", e);
            return Err(self.fail(
                AuthEvent::CredentialError(reason.clone()),
                Error::SessionOpenFailure(reason),
            ));
        }

        self.advance(AuthState::SessionOpening);
        if let Err(e) = handle.open_session() {
            let reason = format!("{:#}", e);
            return Err(self.fail(AuthEvent::SessionError(reason.clone()), Error::SessionOpenFailure(reason)));
        }

        let session_id = match services.broker.session_for_pid(std::process::id()) {
            Ok(id) => id,
            Err(e) => {
                let reason = format!("no broker session: {:#}", e);
                close_session(handle.as_mut(), &self.username);
                return Err(self.fail(
                    AuthEvent::SessionError(reason.clone()),
                    Error::SessionOpenFailure(reason),
                ));
            }
        };

        self.handle = Some(handle);
        self.advance(AuthState::SessionOpen);
        info!("Session {} opened for {}", session_id, self.username);
        self.session_id = Some(session_id.clone());
        self.emit(&AuthEvent::SessionOpened(session_id.clone()));
        Ok(session_id)
    }

    /// Close the session registration. Returns false if it wasn't open.
    pub fn stop(&mut self) -> bool {
        if self.state != AuthState::SessionOpen {
            return false;
        }
        if let Some(handle) = self.handle.as_mut() {
            close_session(handle.as_mut(), &self.username);
        }
        self.advance(AuthState::Closed);
        true
    }

    /// Exported before credentials are established so modules can see them
    fn put_standard_env(&self, handle: &mut dyn AuthHandle, services: &Services) {
        let mut vars = vec![
            ("PATH", self.search_path.clone()),
            ("USER", self.username.clone()),
            ("LOGNAME", self.username.clone()),
        ];
        match services.users.lookup(&self.username) {
            Some(user) => {
                vars.push(("HOME", user.home.to_string_lossy().into_owned()));
                if !user.shell.is_empty() {
                    vars.push(("SHELL", user.shell));
                }
            }
            None => warn!("{} is not in the user database", self.username),
        }
        vars.push(("XDG_SESSION_CLASS", SESSION_CLASS.to_string()));

        for (key, value) in vars {
            if let Err(e) = handle.putenv(key, &value) {
                warn!("putenv {} failed: {:#}", key, e);
            }
        }
    }

    fn advance(&mut self, next: AuthState) {
        debug_assert!(next > self.state, "auth state cannot move back");
        if next > self.state {
            self.state = next;
        }
    }

    fn fail(&mut self, event: AuthEvent, error: Error) -> Error {
        warn!("{} ({}): {}", self.username, self.service, error);
        self.state = AuthState::Error;
        self.emit(&event);
        error
    }

    fn emit(&mut self, event: &AuthEvent) {
        for listener in self.listeners.iter_mut() {
            listener(event);
        }
    }
}

fn close_session(handle: &mut dyn AuthHandle, username: &str) {
    match handle.close_session() {
        Ok(()) => debug!("Session for {} closed", username),
        // The registration is gone either way; nothing to retry
        Err(e) => warn!("Closing session for {} failed: {:#}", username, e),
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.stop();
    }
}
