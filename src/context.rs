//! Collaborators injected into the lifecycle engine

use crate::auth::AuthBackend;
use crate::broker::LoginBroker;
use crate::mainloop::EventLoop;
use crate::plugins::AccountPlugin;
use crate::process::ProcessSupervisor;
use crate::utils::UserDb;

/// External services, owned by the manager and shared read-only
pub struct Services {
    pub auth: Box<dyn AuthBackend>,
    pub broker: Box<dyn LoginBroker>,
    pub users: Box<dyn UserDb>,
    pub accounts: Option<Box<dyn AccountPlugin>>,
}

/// Everything a seat operation needs besides the seat itself
pub struct SeatContext<'a> {
    pub services: &'a Services,
    pub supervisor: &'a mut ProcessSupervisor,
    pub event_loop: &'a mut EventLoop,
}
