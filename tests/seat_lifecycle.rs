//! Seat lifecycle tests
//!
//! Drive a [`Manager`] with in-process auth, broker and user database
//! stand-ins. Session leaders are real `/bin/sh` children running
//! `sleep`, so switching and logout exercise the real signal ladder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getegid, geteuid, Pid};

use seatwarden::auth::{AuthBackend, AuthHandle, Conversation, MessageStyle};
use seatwarden::broker::{LoginBroker, SeatChange, SeatInfo};
use seatwarden::config::Config;
use seatwarden::context::Services;
use seatwarden::mainloop::Waker;
use seatwarden::manager::Manager;
use seatwarden::seat::{LoginRequest, SeatState};
use seatwarden::utils::{UserDb, UserRecord};
use seatwarden::Error;

const PASSWORDS: &[(&str, &str)] = &[("alice", "secret"), ("bob", "pw"), ("carol", "pw2"), ("guest0", "")];

struct TestAuth;

struct TestHandle {
    username: String,
    conversation: Conversation,
    env: Vec<(String, String)>,
}

impl AuthBackend for TestAuth {
    fn begin(&self, _service: &str, username: &str, conversation: Conversation) -> anyhow::Result<Box<dyn AuthHandle>> {
        Ok(Box::new(TestHandle {
            username: username.to_string(),
            conversation,
            env: Vec::new(),
        }))
    }
}

impl AuthHandle for TestHandle {
    fn authenticate(&mut self) -> anyhow::Result<()> {
        let answer = self
            .conversation
            .respond(MessageStyle::PromptEchoOff, "Password: ")
            .ok_or_else(|| anyhow!("no answer"))?;
        match PASSWORDS.iter().find(|(user, _)| *user == self.username) {
            Some((_, expected)) if answer.as_str() == *expected => Ok(()),
            _ => Err(anyhow!("Authentication failure")),
        }
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

/// Seat changes the test pushes after startup
#[derive(Clone, Default)]
struct BrokerFeed {
    sender: Arc<Mutex<Option<(mpsc::Sender<SeatChange>, Arc<Waker>)>>>,
}

impl BrokerFeed {
    fn push(&self, change: SeatChange) {
        let guard = self.sender.lock().unwrap();
        let (tx, waker) = guard.as_ref().expect("manager subscribed");
        tx.send(change).unwrap();
        waker.wake();
    }
}

struct TestBroker {
    seats: Vec<&'static str>,
    feed: BrokerFeed,
}

impl LoginBroker for TestBroker {
    fn list_seats(&self) -> anyhow::Result<Vec<SeatInfo>> {
        Ok(self.seats.iter().map(|id| seat_info(id)).collect())
    }
    fn session_for_pid(&self, pid: u32) -> anyhow::Result<String> {
        Ok(format!("c{}", pid))
    }
    fn subscribe_seat_changes(&self, waker: Arc<Waker>) -> anyhow::Result<mpsc::Receiver<SeatChange>> {
        let (tx, rx) = mpsc::channel();
        *self.feed.sender.lock().unwrap() = Some((tx, waker));
        Ok(rx)
    }
}

struct TestUsers;

impl UserDb for TestUsers {
    fn lookup(&self, name: &str) -> Option<UserRecord> {
        PASSWORDS.iter().any(|(user, _)| *user == name).then(|| UserRecord {
            name: name.to_string(),
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
            home: std::env::temp_dir(),
            shell: "/bin/sh".to_string(),
        })
    }
}

fn seat_info(id: &str) -> SeatInfo {
    SeatInfo {
        id: id.to_string(),
        path: format!("/org/freedesktop/login1/seat/{}", id),
    }
}

fn config(auto_login: bool) -> Config {
    let mut config = Config::default();
    config.general.control_socket = String::new();
    config.general.session_cmd = "exec sleep 30".to_string();
    config.general.terminate_timeout = 1;
    config.general.auto_login = auto_login;
    config.general.accounts_plugin = String::new();
    config
}

fn manager_with(seats: Vec<&'static str>, auto_login: bool) -> (Manager, BrokerFeed) {
    let feed = BrokerFeed::default();
    let services = Services {
        auth: Box::new(TestAuth),
        broker: Box::new(TestBroker {
            seats,
            feed: feed.clone(),
        }),
        users: Box::new(TestUsers),
        accounts: None,
    };
    let mut manager = Manager::new(config(auto_login), services, Vec::new()).unwrap();
    manager.start().unwrap();
    (manager, feed)
}

fn manager() -> Manager {
    manager_with(vec!["seat0"], false).0
}

fn pump_until(manager: &mut Manager, what: &str, done: impl Fn(&Manager) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !done(&*manager) {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        manager.run_once(Some(Duration::from_millis(100))).unwrap();
    }
}

fn login(user: &str, password: &str) -> LoginRequest {
    LoginRequest::user(Some("login"), user, Some(password))
}

fn state(manager: &Manager, seat: &str) -> SeatState {
    manager.seat(seat).unwrap().state()
}

fn session_user(manager: &Manager, seat: &str) -> Option<String> {
    manager
        .seat(seat)
        .and_then(|s| s.session())
        .map(|s| s.username().to_string())
}

fn session_pid(manager: &Manager, seat: &str) -> Pid {
    manager.seat(seat).unwrap().session().unwrap().pid()
}

fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

#[test]
fn test_login_forks_one_session_leader() {
    let mut manager = manager();
    assert_eq!(manager.seat_count(), 1);
    assert_eq!(state(&manager, "seat0"), SeatState::Idle);

    manager.handle_login("seat0", login("alice", "secret")).unwrap();

    assert_eq!(state(&manager, "seat0"), SeatState::Active);
    assert_eq!(session_user(&manager, "seat0").as_deref(), Some("alice"));
    assert_eq!(manager.tracked_processes(), 1);
    let session = manager.seat("seat0").unwrap().session().unwrap();
    assert_eq!(session.service(), "login");
    assert_eq!(session.seat_id(), "seat0");
    assert!(session.session_id().is_some_and(|id| id.starts_with('c')));

    // A second login on a busy seat is rejected
    assert!(matches!(
        manager.handle_login("seat0", login("bob", "pw")),
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(manager.tracked_processes(), 1);

    manager.stop();
    assert_eq!(manager.tracked_processes(), 0);
}

#[test]
fn test_switch_user_recreates_session() {
    let mut manager = manager();
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    let alice = session_pid(&manager, "seat0");

    manager.handle_switch_user("seat0", login("bob", "pw")).unwrap();
    assert_eq!(state(&manager, "seat0"), SeatState::Draining);

    pump_until(&mut manager, "bob's session", |m| {
        session_user(m, "seat0").as_deref() == Some("bob")
    });
    assert_eq!(state(&manager, "seat0"), SeatState::Active);
    assert_eq!(manager.tracked_processes(), 1);
    assert!(!is_alive(alice));

    manager.stop();
}

#[test]
fn test_wrong_password_leaves_seat_idle() {
    let mut manager = manager();

    let result = manager.handle_login("seat0", login("alice", "guess"));
    assert!(matches!(result, Err(Error::AuthFailure(_))));
    assert_eq!(state(&manager, "seat0"), SeatState::Idle);
    assert_eq!(manager.tracked_processes(), 0);

    // The seat is still usable
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    assert_eq!(state(&manager, "seat0"), SeatState::Active);
    manager.stop();
}

#[test]
fn test_unknown_user_rejected() {
    let mut manager = manager();
    assert!(matches!(
        manager.handle_login("seat0", login("mallory", "x")),
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(manager.tracked_processes(), 0);
}

#[test]
fn test_switch_requests_coalesce() {
    let mut manager = manager();
    manager.handle_login("seat0", login("alice", "secret")).unwrap();

    manager.handle_switch_user("seat0", login("bob", "pw")).unwrap();
    manager.handle_switch_user("seat0", login("carol", "pw2")).unwrap();

    pump_until(&mut manager, "carol's session", |m| {
        session_user(m, "seat0").as_deref() == Some("carol")
    });
    assert_eq!(manager.tracked_processes(), 1);

    // Nothing else is queued behind carol
    let carol = session_pid(&manager, "seat0");
    for _ in 0..5 {
        manager.run_once(Some(Duration::from_millis(50))).unwrap();
    }
    assert_eq!(session_pid(&manager, "seat0"), carol);
    manager.stop();
}

/// Kill the leader and pump until it is reaped, leaving its exit
/// notification unread
fn reap_behind_seat(manager: &mut Manager) -> Pid {
    let pid = session_pid(manager, "seat0");
    kill(pid, Signal::SIGKILL).unwrap();
    pump_until(manager, "leader reaped", |m| m.tracked_processes() == 0);
    assert_eq!(state(manager, "seat0"), SeatState::Active);
    pid
}

#[test]
fn test_switch_after_leader_reaped_succeeds() {
    let mut manager = manager();
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    let alice = reap_behind_seat(&mut manager);

    manager.handle_switch_user("seat0", login("bob", "pw")).unwrap();
    assert_eq!(state(&manager, "seat0"), SeatState::Draining);

    pump_until(&mut manager, "bob's session", |m| {
        session_user(m, "seat0").as_deref() == Some("bob")
    });
    assert_ne!(session_pid(&manager, "seat0"), alice);
    assert_eq!(manager.tracked_processes(), 1);
    manager.stop();
}

#[test]
fn test_logout_after_leader_reaped_succeeds() {
    let mut manager = manager();
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    reap_behind_seat(&mut manager);

    manager.handle_logout("seat0").unwrap();
    pump_until(&mut manager, "seat0 idle", |m| state(m, "seat0") == SeatState::Idle);
    assert_eq!(manager.tracked_processes(), 0);

    // Nothing was left queued behind the logout
    for _ in 0..5 {
        manager.run_once(Some(Duration::from_millis(50))).unwrap();
    }
    assert_eq!(state(&manager, "seat0"), SeatState::Idle);
}

#[test]
fn test_switch_on_idle_seat_logs_in_directly() {
    let mut manager = manager();
    manager.handle_switch_user("seat0", login("bob", "pw")).unwrap();
    assert_eq!(state(&manager, "seat0"), SeatState::Active);
    assert_eq!(session_user(&manager, "seat0").as_deref(), Some("bob"));
    manager.stop();
}

#[test]
fn test_add_seat_is_idempotent() {
    let mut manager = manager();
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    let pid = session_pid(&manager, "seat0");

    assert!(!manager.add_seat("seat0", None).unwrap());
    assert_eq!(manager.seat_count(), 1);
    assert_eq!(session_pid(&manager, "seat0"), pid);

    assert!(manager.add_seat("seat1", None).unwrap());
    assert_eq!(manager.seat_count(), 2);
    assert_eq!(state(&manager, "seat1"), SeatState::Idle);
    manager.stop();
}

#[test]
fn test_authenticate_unknown_seat() {
    let mut manager = manager();
    let result = manager.handle_authenticate("seat9", None, Some("alice"), Some("secret"));
    assert!(matches!(result, Err(Error::SeatNotReady(_))));
    assert_eq!(manager.seat_count(), 1);

    manager
        .handle_authenticate("seat0", None, Some("alice"), Some("secret"))
        .unwrap();
    assert_eq!(session_user(&manager, "seat0").as_deref(), Some("alice"));
    manager.stop();
}

#[test]
fn test_logout_returns_to_idle() {
    let mut manager = manager();
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    let pid = session_pid(&manager, "seat0");

    manager.handle_logout("seat0").unwrap();
    assert_eq!(state(&manager, "seat0"), SeatState::Draining);
    pump_until(&mut manager, "seat0 idle", |m| state(m, "seat0") == SeatState::Idle);
    assert_eq!(manager.tracked_processes(), 0);
    assert!(!is_alive(pid));

    assert!(matches!(manager.handle_logout("seat0"), Err(Error::InvalidInput(_))));
    assert!(matches!(manager.handle_logout("seat7"), Err(Error::SeatNotReady(_))));
}

#[test]
fn test_auto_login_on_discovery_and_after_exit() {
    let (mut manager, _feed) = manager_with(vec!["seat0"], true);
    assert_eq!(state(&manager, "seat0"), SeatState::Active);
    assert_eq!(session_user(&manager, "seat0").as_deref(), Some("guest0"));
    let first = session_pid(&manager, "seat0");

    // The session ends on its own; the default user is logged in again
    kill(first, Signal::SIGKILL).unwrap();
    pump_until(&mut manager, "auto-login", |m| {
        m.seat("seat0")
            .and_then(|s| s.session())
            .is_some_and(|s| s.pid() != first)
    });
    assert_eq!(session_user(&manager, "seat0").as_deref(), Some("guest0"));
    assert_eq!(manager.tracked_processes(), 1);

    // A pending switch wins over auto-login
    manager.handle_switch_user("seat0", login("alice", "secret")).unwrap();
    pump_until(&mut manager, "alice", |m| session_user(m, "seat0").as_deref() == Some("alice"));
    manager.stop();
}

#[test]
fn test_seat_hotplug() {
    let (mut manager, feed) = manager_with(vec!["seat0"], false);
    manager.handle_login("seat0", login("alice", "secret")).unwrap();
    let pid = session_pid(&manager, "seat0");

    feed.push(SeatChange::Added(seat_info("seat1")));
    feed.push(SeatChange::Added(seat_info("seat1")));
    pump_until(&mut manager, "seat1", |m| m.seat("seat1").is_some());
    assert_eq!(manager.seat_count(), 2);
    assert_eq!(
        manager.seat("seat1").unwrap().path(),
        Some("/org/freedesktop/login1/seat/seat1")
    );

    feed.push(SeatChange::Removed(seat_info("seat0")));
    pump_until(&mut manager, "seat0 removal", |m| m.seat("seat0").is_none());
    assert_eq!(manager.seat_count(), 1);
    assert_eq!(manager.tracked_processes(), 0);
    assert!(!is_alive(pid));

    assert!(!manager.remove_seat("seat0"));
    manager.stop();
}

#[test]
fn test_seats_summary_and_stop() {
    let mut manager = manager_with(vec!["seat0", "seat1"], false).0;
    manager.handle_login("seat1", login("bob", "pw")).unwrap();
    assert_eq!(manager.seats_summary(), "seat0:idle seat1:active:bob");

    let pid = session_pid(&manager, "seat1");
    manager.stop();
    assert!(manager.is_stopped());
    assert_eq!(manager.tracked_processes(), 0);
    assert!(manager.seat("seat1").unwrap().session().is_none());
    assert!(!is_alive(pid));
}

#[test]
fn test_environment_reaches_session() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env");

    let mut config = config(false);
    config.general.session_cmd = format!("env > {}; exec sleep 30", out.display());
    let services = Services {
        auth: Box::new(TestAuth),
        broker: Box::new(TestBroker {
            seats: vec!["seat0"],
            feed: BrokerFeed::default(),
        }),
        users: Box::new(TestUsers),
        accounts: None,
    };
    let mut manager = Manager::new(config, services, Vec::new()).unwrap();
    manager.sync_seats();

    let mut request = login("alice", "secret");
    request.environment.push(("SEATWARDEN_GREETING".into(), "hello".into()));
    manager.handle_login("seat0", request).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let env = loop {
        let content = std::fs::read_to_string(&out).unwrap_or_default();
        if content.contains("XDG_SEAT=") {
            break content;
        }
        assert!(Instant::now() < deadline, "session never wrote its environment");
        manager.run_once(Some(Duration::from_millis(50))).unwrap();
    };
    let vars: HashMap<&str, &str> = env.lines().filter_map(|l| l.split_once('=')).collect();
    assert_eq!(vars.get("USER"), Some(&"alice"));
    assert_eq!(vars.get("LOGNAME"), Some(&"alice"));
    assert_eq!(vars.get("XDG_SEAT"), Some(&"seat0"));
    assert_eq!(vars.get("XDG_SESSION_CLASS"), Some(&"user"));
    assert_eq!(vars.get("SEATWARDEN_GREETING"), Some(&"hello"));
    assert_eq!(vars.get("HOME").map(PathBuf::from), Some(std::env::temp_dir()));

    manager.stop();
}
