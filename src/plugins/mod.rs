//! Plugin interfaces
//!
//! Accounts plugins provision the default user of a seat. Auth plugins
//! decide when a seat should switch users and report it through an
//! [`AuthTrigger`], which may be used from any thread.

pub mod default;
pub mod gumd;
pub mod signal;

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use log::debug;
use nix::sys::signal::Signal;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::mainloop::Waker;

pub use default::SystemAccounts;
pub use gumd::GumdAccounts;
pub use signal::SignalAuthPlugin;

/// Free-form options from the `[plugins.<name>]` config table
pub type PluginOptions = HashMap<String, String>;

/// Creates and resets the accounts used for default logins
pub trait AccountPlugin: Send {
    fn name(&self) -> &str;

    fn is_valid_user(&self, name: &str) -> bool;

    fn setup_guest_user(&self, name: &str) -> bool;

    /// Remove the account with `delete`, otherwise wipe its home
    fn cleanup_guest_user(&self, name: &str, delete: bool) -> bool;
}

/// A plugin's request to switch a seat
pub struct AuthRequest {
    pub seat_id: String,
    pub service: Option<String>,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
}

/// Channel from auth plugins to the manager's loop
#[derive(Clone)]
pub struct AuthTrigger {
    tx: mpsc::Sender<AuthRequest>,
    waker: Arc<Waker>,
}

impl AuthTrigger {
    pub fn channel(waker: Arc<Waker>) -> (Self, mpsc::Receiver<AuthRequest>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx, waker }, rx)
    }

    /// Ask the manager to switch `seat_id`. Unset fields use the seat's
    /// defaults. Returns false if the manager is gone.
    pub fn on_authenticate(
        &self,
        seat_id: &str,
        service: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> bool {
        let request = AuthRequest {
            seat_id: seat_id.to_string(),
            service: service.map(str::to_string),
            username: username.map(str::to_string),
            password: password.map(|p| Zeroizing::new(p.to_string())),
        };
        if self.tx.send(request).is_err() {
            debug!("Auth request for {} dropped: manager gone", seat_id);
            return false;
        }
        self.waker.wake();
        true
    }
}

/// Source of user-switch requests
pub trait AuthPlugin {
    fn name(&self) -> &str;

    /// Signals the manager should route to [`on_signal`](Self::on_signal)
    fn signals(&self) -> Vec<Signal> {
        Vec::new()
    }

    fn start(&mut self, trigger: AuthTrigger) -> anyhow::Result<()>;

    fn on_signal(&mut self, _signal: Signal) {}

    fn stop(&mut self) {}
}

type AccountFactory = fn(&PluginOptions) -> Box<dyn AccountPlugin>;
type AuthFactory = fn(&PluginOptions) -> Box<dyn AuthPlugin>;

/// Plugin constructors by name
#[derive(Default)]
pub struct PluginRegistry {
    accounts: HashMap<String, AccountFactory>,
    auth: HashMap<String, AuthFactory>,
}

impl PluginRegistry {
    /// Registry holding the plugins shipped with seatwarden
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register_account("default", |_| Box::new(SystemAccounts::new()));
        registry.register_account("gumd", |opts| Box::new(GumdAccounts::new(opts)));
        registry.register_auth("signal", |opts| Box::new(SignalAuthPlugin::new(opts)));
        registry
    }

    pub fn register_account(&mut self, name: &str, factory: AccountFactory) {
        self.accounts.insert(name.to_string(), factory);
    }

    pub fn register_auth(&mut self, name: &str, factory: AuthFactory) {
        self.auth.insert(name.to_string(), factory);
    }

    pub fn account_plugin(&self, name: &str, options: &PluginOptions) -> Result<Box<dyn AccountPlugin>> {
        let factory = self
            .accounts
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown accounts plugin: {}", name)))?;
        Ok(factory(options))
    }

    pub fn auth_plugin(&self, name: &str, options: &PluginOptions) -> Result<Box<dyn AuthPlugin>> {
        let factory = self
            .auth
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown auth plugin: {}", name)))?;
        Ok(factory(options))
    }
}
