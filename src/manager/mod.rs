//! Seat manager
//!
//! Owns the seat table, the event loop and the session supervisor. Seats
//! come from the login broker (or the static config list when it can't
//! enumerate them), login requests come from auth plugins and the control
//! socket, and process exits are routed back to the seat that owns them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;

use crate::broker::SeatChange;
use crate::config::Config;
use crate::context::{SeatContext, Services};
use crate::control::{ControlServer, Request, Response};
use crate::error::{Error, Result};
use crate::mainloop::{ChildStatus, Event, EventLoop, Token, Waker};
use crate::plugins::{AuthPlugin, AuthRequest, AuthTrigger};
use crate::process::{ProcessEvent, ProcessSupervisor, SupervisorPolicy};
use crate::seat::{LoginRequest, Seat, SeatState};

pub struct Manager {
    config: Config,
    /// File to re-read on SIGHUP (None = normal lookup order)
    config_path: Option<PathBuf>,
    services: Services,
    seats: HashMap<String, Seat>,
    seat_tokens: HashMap<Token, String>,
    supervisor: ProcessSupervisor,
    event_loop: EventLoop,
    waker: Arc<Waker>,
    waker_token: Token,
    trigger: AuthTrigger,
    auth_requests: mpsc::Receiver<AuthRequest>,
    plugins: Vec<Box<dyn AuthPlugin>>,
    seat_changes: Option<mpsc::Receiver<SeatChange>>,
    control: Option<ControlServer>,
    stopping: bool,
    stopped: bool,
}

impl Manager {
    pub fn new(config: Config, services: Services, plugins: Vec<Box<dyn AuthPlugin>>) -> Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let waker = Arc::new(Waker::new()?);
        let waker_token = event_loop.watch_fd(waker.as_raw_fd());
        let (trigger, auth_requests) = AuthTrigger::channel(Arc::clone(&waker));
        let supervisor = ProcessSupervisor::new(SupervisorPolicy {
            exit_when_empty: false,
            terminate_timeout: config.terminate_timeout(),
        });

        Ok(Self {
            config,
            config_path: None,
            services,
            seats: HashMap::new(),
            seat_tokens: HashMap::new(),
            supervisor,
            event_loop,
            waker,
            waker_token,
            trigger,
            auth_requests,
            plugins,
            seat_changes: None,
            control: None,
            stopping: false,
            stopped: false,
        })
    }

    /// Reload from `path` on SIGHUP instead of the default lookup
    pub fn set_config_path(&mut self, path: &Path) {
        self.config_path = Some(path.to_path_buf());
    }

    /// Install signal routing, discover seats, start plugins and the
    /// control socket
    pub fn start(&mut self) -> Result<()> {
        for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
            self.event_loop.handle_signal(sig)?;
        }
        for plugin in &self.plugins {
            for sig in plugin.signals() {
                self.event_loop.handle_signal(sig)?;
            }
        }

        // Subscribe first so a seat appearing during the sync isn't missed
        if let Err(e) = self.subscribe_seat_changes() {
            warn!("Seat change notifications unavailable: {:#}", e);
        }
        self.sync_seats();

        for plugin in &mut self.plugins {
            match plugin.start(self.trigger.clone()) {
                Ok(()) => info!("Auth plugin {} started", plugin.name()),
                Err(e) => warn!("Auth plugin {} failed to start: {:#}", plugin.name(), e),
            }
        }

        let socket = self.config.general.control_socket.trim().to_string();
        if !socket.is_empty() {
            match ControlServer::bind(Path::new(&socket), &mut self.event_loop) {
                Ok(server) => self.control = Some(server),
                Err(e) => warn!("Control socket {} unavailable: {}", socket, e),
            }
        }

        info!("Managing {} seat(s)", self.seats.len());
        Ok(())
    }

    /// One-shot enumeration from the broker, falling back to static seats
    pub fn sync_seats(&mut self) {
        let seats = match self.services.broker.list_seats() {
            Ok(seats) => seats.into_iter().map(|s| (s.id, Some(s.path))).collect(),
            Err(e) => {
                warn!("Failed to list seats: {:#}, using configured seats", e);
                self.config
                    .static_seats()
                    .into_iter()
                    .map(|id| (id, None))
                    .collect::<Vec<_>>()
            }
        };
        for (id, path) in seats {
            if let Err(e) = self.add_seat(&id, path.as_deref()) {
                warn!("Failed to add seat {}: {}", id, e);
            }
        }
    }

    /// Register for seat add/remove notifications from the broker
    pub fn subscribe_seat_changes(&mut self) -> anyhow::Result<()> {
        let rx = self
            .services
            .broker
            .subscribe_seat_changes(Arc::clone(&self.waker))?;
        self.seat_changes = Some(rx);
        Ok(())
    }

    /// Insert a seat. Returns Ok(false) if the id is already known.
    pub fn add_seat(&mut self, id: &str, path: Option<&str>) -> Result<bool> {
        if self.seats.contains_key(id) {
            debug!("Seat {} already known", id);
            return Ok(false);
        }

        let mut seat = Seat::new(id, path, self.config.seat(id))?;
        let token = self.event_loop.watch_fd(seat.notify_fd());
        info!("Seat {} added", id);

        if seat.settings().auto_login {
            info!("Seat {}: auto-login", id);
            let mut ctx = SeatContext {
                services: &self.services,
                supervisor: &mut self.supervisor,
                event_loop: &mut self.event_loop,
            };
            if let Err(e) = seat.create_session(LoginRequest::default(), &mut ctx) {
                warn!("Seat {}: auto-login failed: {}", id, e);
            }
        }

        self.seat_tokens.insert(token, id.to_string());
        self.seats.insert(id.to_string(), seat);
        Ok(true)
    }

    /// Remove a seat, stopping its session. Returns false if unknown.
    pub fn remove_seat(&mut self, id: &str) -> bool {
        let Some(mut seat) = self.seats.remove(id) else {
            debug!("Seat {} not known, nothing to remove", id);
            return false;
        };
        self.seat_tokens.retain(|token, seat_id| {
            if seat_id.as_str() == id {
                self.event_loop.unwatch_fd(*token);
                false
            } else {
                true
            }
        });

        let mut ctx = SeatContext {
            services: &self.services,
            supervisor: &mut self.supervisor,
            event_loop: &mut self.event_loop,
        };
        seat.shutdown(&mut ctx);
        self.route_process_events();
        info!("Seat {} removed", id);
        true
    }

    /// Auth plugin callback: switch `seat_id` to the given identity
    pub fn handle_authenticate(
        &mut self,
        seat_id: &str,
        service: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        if !self.seats.contains_key(seat_id) {
            warn!("Authentication request for unknown seat {}", seat_id);
            return Err(Error::SeatNotReady(seat_id.to_string()));
        }
        let request = LoginRequest {
            service: service.map(str::to_string),
            username: username.map(str::to_string),
            password: password.map(|p| p.to_string().into()),
            environment: Vec::new(),
        };
        self.handle_switch_user(seat_id, request)
    }

    pub fn handle_login(&mut self, seat_id: &str, request: LoginRequest) -> Result<()> {
        self.with_seat(seat_id, |seat, ctx| seat.create_session(request, ctx))
    }

    pub fn handle_switch_user(&mut self, seat_id: &str, request: LoginRequest) -> Result<()> {
        self.with_seat(seat_id, |seat, ctx| seat.switch_user(request, ctx))
    }

    pub fn handle_logout(&mut self, seat_id: &str) -> Result<()> {
        self.with_seat(seat_id, |seat, ctx| seat.terminate_session(ctx))
    }

    pub fn seat(&self, id: &str) -> Option<&Seat> {
        self.seats.get(id)
    }

    pub fn seat_count(&self) -> usize {
        self.seats.len()
    }

    /// Session leaders still tracked by the supervisor
    pub fn tracked_processes(&self) -> usize {
        self.supervisor.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// `id:state[:user]` for every seat, sorted by id
    pub fn seats_summary(&self) -> String {
        let mut ids: Vec<&String> = self.seats.keys().collect();
        ids.sort();
        ids.iter()
            .map(|id| {
                let seat = &self.seats[*id];
                match seat.session() {
                    Some(session) => format!("{}:{}:{}", id, seat.state(), session.username()),
                    None => format!("{}:{}", id, seat.state()),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run until stopped
    pub fn run(&mut self) -> Result<()> {
        while !self.stopped {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Wait for one batch of events (at most `limit`) and dispatch it
    pub fn run_once(&mut self, limit: Option<Duration>) -> Result<()> {
        let events = self.event_loop.wait(limit)?;
        for event in events {
            if self.stopped {
                break;
            }
            self.dispatch(event);
        }
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Signal(sig) => self.handle_signal(sig),
            Event::ChildExited { .. } | Event::Timer(_) => {
                if !self.supervisor.handle_event(&event, &mut self.event_loop) {
                    debug!("Unclaimed event {:?}", event);
                }
                self.route_process_events();
            }
            Event::Readable(token) if token == self.waker_token => {
                self.waker.drain();
                self.drain_auth_requests();
                self.drain_seat_changes();
            }
            Event::Readable(token) => {
                if let Some(seat_id) = self.seat_tokens.get(&token).cloned() {
                    self.handle_seat_notify(&seat_id);
                } else if self.control.as_ref().is_some_and(|c| c.owns(token)) {
                    self.handle_control(token);
                }
            }
        }
    }

    fn handle_signal(&mut self, sig: Signal) {
        match sig {
            Signal::SIGTERM | Signal::SIGINT => {
                info!("Received {}, shutting down", sig);
                self.stop();
            }
            Signal::SIGHUP => self.reload_config(),
            _ => {
                for plugin in &mut self.plugins {
                    if plugin.signals().contains(&sig) {
                        plugin.on_signal(sig);
                    }
                }
            }
        }
    }

    fn drain_auth_requests(&mut self) {
        while let Ok(request) = self.auth_requests.try_recv() {
            let result = self.handle_authenticate(
                &request.seat_id,
                request.service.as_deref(),
                request.username.as_deref(),
                request.password.as_deref().map(String::as_str),
            );
            if let Err(e) = result {
                warn!("Authentication request for {} failed: {}", request.seat_id, e);
            }
        }
    }

    fn drain_seat_changes(&mut self) {
        let changes: Vec<SeatChange> = match &self.seat_changes {
            Some(rx) => rx.try_iter().collect(),
            None => return,
        };
        for change in changes {
            match change {
                SeatChange::Added(info) => {
                    if let Err(e) = self.add_seat(&info.id, Some(&info.path)) {
                        warn!("Failed to add seat {}: {}", info.id, e);
                    }
                }
                SeatChange::Removed(info) => {
                    self.remove_seat(&info.id);
                }
            }
        }
    }

    fn handle_seat_notify(&mut self, seat_id: &str) {
        let stopping = self.stopping;
        let Some(seat) = self.seats.get_mut(seat_id) else {
            return;
        };
        let mut ctx = SeatContext {
            services: &self.services,
            supervisor: &mut self.supervisor,
            event_loop: &mut self.event_loop,
        };
        let state = seat.handle_notify(&mut ctx, stopping);
        debug!("Seat {} is {}", seat_id, state);
    }

    fn handle_control(&mut self, token: Token) {
        let requests = match self.control.as_mut() {
            Some(control) => control.poll(token, &mut self.event_loop),
            None => return,
        };
        for (client, request) in requests {
            let response = match request {
                Ok(request) => Response::from(self.execute(request)),
                Err(e) => Response::Error(e.to_string()),
            };
            if let Some(control) = self.control.as_mut() {
                control.respond(client, &response, &mut self.event_loop);
            }
        }
    }

    fn execute(&mut self, request: Request) -> Result<Option<String>> {
        match request {
            Request::Login {
                seat,
                username,
                password,
                environment,
            } => {
                info!("Control: login {} on {}", username, seat);
                let request = LoginRequest {
                    service: None,
                    username: Some(username),
                    password: Some(password),
                    environment,
                };
                self.handle_login(&seat, request).map(|_| None)
            }
            Request::Switch {
                seat,
                username,
                password,
                environment,
            } => {
                info!(
                    "Control: switch {} to {}",
                    seat,
                    username.as_deref().unwrap_or("default user")
                );
                let request = LoginRequest {
                    service: None,
                    username,
                    password,
                    environment,
                };
                self.handle_switch_user(&seat, request).map(|_| None)
            }
            Request::Logout { seat } => {
                info!("Control: logout {}", seat);
                self.handle_logout(&seat).map(|_| None)
            }
            Request::Seats => Ok(Some(self.seats_summary())),
            Request::Launch { .. } | Request::Stop { .. } | Request::List => Err(Error::InvalidInput(
                "process requests go to the session launcher".into(),
            )),
        }
    }

    fn with_seat<T>(
        &mut self,
        seat_id: &str,
        f: impl FnOnce(&mut Seat, &mut SeatContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let seat = self
            .seats
            .get_mut(seat_id)
            .ok_or_else(|| Error::SeatNotReady(seat_id.to_string()))?;
        let mut ctx = SeatContext {
            services: &self.services,
            supervisor: &mut self.supervisor,
            event_loop: &mut self.event_loop,
        };
        f(seat, &mut ctx)
    }

    /// Hand supervisor reports to the seats that own the pids
    fn route_process_events(&mut self) {
        for event in self.supervisor.take_events() {
            match event {
                ProcessEvent::Stopped { pid, status } => {
                    if !self.seats.values_mut().any(|seat| seat.child_exited(pid, status)) {
                        debug!("pid {} stopped with no seat attached", pid);
                    }
                }
                ProcessEvent::Signalled { pid, signal } => debug!("Sent {} to {}", signal, pid),
                ProcessEvent::Stuck { pid } => {
                    // Release the seat; the process stays tracked
                    if self
                        .seats
                        .values_mut()
                        .any(|seat| seat.child_exited(pid, ChildStatus::Unknown))
                    {
                        error!("Session leader {} is stuck, releasing its seat", pid);
                    }
                }
                ProcessEvent::Empty => {}
            }
        }
    }

    /// Re-read the config file. New values apply to future sessions.
    pub fn reload_config(&mut self) {
        let loaded = match &self.config_path {
            Some(path) => Config::load_from_file(path),
            None => Ok(Config::load()),
        };
        let config = match loaded {
            Ok(config) => config,
            Err(e) => {
                warn!("Config reload failed, keeping current settings: {:#}", e);
                return;
            }
        };

        self.supervisor.set_terminate_timeout(config.terminate_timeout());
        for (id, seat) in &mut self.seats {
            seat.set_settings(config.seat(id));
        }
        self.config = config;
        info!("Config reloaded");
    }

    /// Stop plugins and every session, then leave the loop
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopping = true;

        for plugin in &mut self.plugins {
            plugin.stop();
        }

        let active = self
            .seats
            .values()
            .filter(|seat| seat.state() != SeatState::Idle)
            .count();
        if active > 0 {
            info!("Stopping {} session(s)", active);
        }
        self.supervisor.stop_all_blocking(&mut self.event_loop);
        self.route_process_events();
        for seat in self.seats.values_mut() {
            seat.discard_session();
        }

        if let Some(mut control) = self.control.take() {
            control.shutdown(&mut self.event_loop);
        }
        self.stopped = true;
        info!("Manager stopped");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthBackend, AuthHandle, Conversation};
    use crate::broker::{LoginBroker, SeatInfo};
    use crate::utils::{UserDb, UserRecord};
    use anyhow::anyhow;
    use nix::sys::signal::kill;
    use nix::sys::wait::waitpid;
    use nix::unistd::{getegid, geteuid};
    use std::time::Instant;

    struct OpenAuth;

    struct OpenHandle {
        env: Vec<(String, String)>,
    }

    impl AuthBackend for OpenAuth {
        fn begin(&self, _service: &str, _user: &str, _conversation: Conversation) -> anyhow::Result<Box<dyn AuthHandle>> {
            Ok(Box::new(OpenHandle { env: Vec::new() }))
        }
    }

    impl AuthHandle for OpenHandle {
        fn authenticate(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn establish_credentials(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn open_session(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn close_session(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn putenv(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
            self.env.push((key.to_string(), value.to_string()));
            Ok(())
        }
        fn environment(&self) -> Vec<(String, String)> {
            self.env.clone()
        }
    }

    struct OneSeat;

    impl LoginBroker for OneSeat {
        fn list_seats(&self) -> anyhow::Result<Vec<SeatInfo>> {
            Ok(vec![SeatInfo {
                id: "seat0".into(),
                path: "/org/freedesktop/login1/seat/seat0".into(),
            }])
        }
        fn session_for_pid(&self, pid: u32) -> anyhow::Result<String> {
            Ok(format!("c{}", pid))
        }
        fn subscribe_seat_changes(&self, _waker: Arc<Waker>) -> anyhow::Result<mpsc::Receiver<SeatChange>> {
            Err(anyhow!("unsupported"))
        }
    }

    struct Myself;

    impl UserDb for Myself {
        fn lookup(&self, name: &str) -> Option<UserRecord> {
            Some(UserRecord {
                name: name.to_string(),
                uid: geteuid().as_raw(),
                gid: getegid().as_raw(),
                home: std::env::temp_dir(),
                shell: "/bin/sh".into(),
            })
        }
    }

    fn manager(session_cmd: &str) -> Manager {
        let mut config = Config::default();
        config.general.control_socket = String::new();
        config.general.accounts_plugin = String::new();
        config.general.session_cmd = session_cmd.to_string();
        let services = Services {
            auth: Box::new(OpenAuth),
            broker: Box::new(OneSeat),
            users: Box::new(Myself),
            accounts: None,
        };
        let mut manager = Manager::new(config, services, Vec::new()).unwrap();
        manager.sync_seats();
        manager.supervisor.set_terminate_timeout(Duration::from_millis(200));
        manager
    }

    #[test]
    fn test_stuck_leader_releases_seat() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let mut manager = manager(&format!(
            "trap '' HUP TERM; touch {}; while :; do sleep 1; done",
            ready.display()
        ));

        manager
            .handle_login("seat0", LoginRequest::user(None, "alice", Some("pw")))
            .unwrap();
        let pid = manager.seat("seat0").unwrap().session().unwrap().pid();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !ready.exists() {
            assert!(Instant::now() < deadline, "session never started");
            std::thread::sleep(Duration::from_millis(20));
        }

        // Leave the leader unreaped so SIGKILL cannot make it go away
        manager.event_loop.unwatch_child(pid);

        manager.handle_logout("seat0").unwrap();
        while manager.seat("seat0").unwrap().state() != SeatState::Idle {
            assert!(Instant::now() < deadline, "seat never released");
            manager.run_once(Some(Duration::from_millis(100))).unwrap();
        }

        assert!(manager.seat("seat0").unwrap().session().is_none());
        assert_eq!(manager.tracked_processes(), 1);
        assert!(manager.supervisor.is_tracked(pid));

        waitpid(pid, None).unwrap();
        manager.stop();
        assert!(manager.is_stopped());
    }

    #[test]
    fn test_failed_switch_queues_nothing() {
        let mut manager = manager("exec sleep 30");
        manager
            .handle_login("seat0", LoginRequest::user(None, "alice", Some("pw")))
            .unwrap();
        let pid = manager.seat("seat0").unwrap().session().unwrap().pid();

        // The supervisor lost track of the leader before the seat heard of it
        manager
            .supervisor
            .handle_child_exit(pid, ChildStatus::Unknown, &mut manager.event_loop);
        manager.supervisor.take_events();

        assert!(matches!(
            manager.handle_switch_user("seat0", LoginRequest::user(None, "bob", Some("pw"))),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(manager.seat("seat0").unwrap().state(), SeatState::Active);

        // When the exit finally reaches the seat, bob is not logged in
        kill(pid, Signal::SIGKILL).unwrap();
        waitpid(pid, None).unwrap();
        assert!(manager
            .seats
            .get_mut("seat0")
            .unwrap()
            .child_exited(pid, ChildStatus::Signaled(Signal::SIGKILL)));
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.seat("seat0").unwrap().state() != SeatState::Idle {
            assert!(Instant::now() < deadline, "seat never went idle");
            manager.run_once(Some(Duration::from_millis(100))).unwrap();
        }
        assert!(manager.seat("seat0").unwrap().session().is_none());
        manager.stop();
    }
}
