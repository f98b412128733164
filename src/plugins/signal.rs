//! Auth plugin that switches a seat on SIGUSR1
//!
//! Options: `seat` (default seat0), `service` (seat default if unset).

use log::{info, warn};
use nix::sys::signal::Signal;

use super::{AuthPlugin, AuthTrigger, PluginOptions};

pub struct SignalAuthPlugin {
    seat_id: String,
    service: Option<String>,
    trigger: Option<AuthTrigger>,
}

impl SignalAuthPlugin {
    pub fn new(options: &PluginOptions) -> Self {
        Self {
            seat_id: options
                .get("seat")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "seat0".to_string()),
            service: options.get("service").filter(|s| !s.is_empty()).cloned(),
            trigger: None,
        }
    }
}

impl AuthPlugin for SignalAuthPlugin {
    fn name(&self) -> &str {
        "signal"
    }

    fn signals(&self) -> Vec<Signal> {
        vec![Signal::SIGUSR1]
    }

    fn start(&mut self, trigger: AuthTrigger) -> anyhow::Result<()> {
        info!("Signal auth plugin: SIGUSR1 switches {}", self.seat_id);
        self.trigger = Some(trigger);
        Ok(())
    }

    fn on_signal(&mut self, signal: Signal) {
        if signal != Signal::SIGUSR1 {
            return;
        }
        match &self.trigger {
            Some(trigger) => {
                trigger.on_authenticate(&self.seat_id, self.service.as_deref(), None, None);
            }
            None => warn!("Signal auth plugin received {} before start", signal),
        }
    }

    fn stop(&mut self) {
        self.trigger = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Waker;
    use std::sync::Arc;

    #[test]
    fn test_sigusr1_requests_default_login() {
        let mut options = PluginOptions::new();
        options.insert("seat".into(), "seat2".into());
        options.insert("service".into(), "kiosk".into());
        let mut plugin = SignalAuthPlugin::new(&options);

        let (trigger, rx) = AuthTrigger::channel(Arc::new(Waker::new().unwrap()));
        plugin.on_signal(Signal::SIGUSR1);
        assert!(rx.try_recv().is_err());

        plugin.start(trigger).unwrap();
        plugin.on_signal(Signal::SIGUSR2);
        assert!(rx.try_recv().is_err());

        plugin.on_signal(Signal::SIGUSR1);
        let request = rx.try_recv().unwrap();
        assert_eq!(request.seat_id, "seat2");
        assert_eq!(request.service.as_deref(), Some("kiosk"));
        assert!(request.username.is_none());
        assert!(request.password.is_none());

        plugin.stop();
        plugin.on_signal(Signal::SIGUSR1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_default_seat() {
        let plugin = SignalAuthPlugin::new(&PluginOptions::new());
        assert_eq!(plugin.seat_id, "seat0");
        assert_eq!(plugin.service, None);
    }
}
