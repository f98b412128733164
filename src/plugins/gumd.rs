//! Accounts plugin backed by the gumd user management daemon
//!
//! D-Bus calls run on a separate thread (tokio runtime), like the logind
//! broker. The bus connection is made on the first request, so creating
//! the plugin never blocks the daemon.
//!
//! Options (`[plugins.gumd]`):
//! - `address`: D-Bus address to use instead of the system bus
//! - `service`: bus name of the daemon

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use super::default::clear_home;
use super::{AccountPlugin, PluginOptions};
use crate::constants::{
    BROKER_REPLY_TIMEOUT, GUMD_SERVICE, GUMD_USERTYPE_GUEST, GUMD_USER_INTERFACE, GUMD_USER_SERVICE_PATH,
};

#[zbus::proxy(
    interface = "org.O1.SecurityAccounts.gUserManagement.UserService",
    default_service = "org.O1.SecurityAccounts.gUserManagement",
    default_path = "/org/O1/SecurityAccounts/gUserManagement/UserService"
)]
trait GumUserService {
    #[zbus(name = "createNewUser")]
    fn create_new_user(&self) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    #[zbus(name = "getUserByName")]
    fn get_user_by_name(&self, username: &str) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;
}

type Reply<T> = mpsc::Sender<Result<T>>;

/// Request from the main thread to the gumd thread
enum GumdRequest {
    Exists(String, Reply<()>),
    CreateGuest(String, Reply<u32>),
    Delete(String, Reply<()>),
    HomeDir(String, Reply<PathBuf>),
}

impl GumdRequest {
    fn fail(self, error: anyhow::Error) {
        match self {
            GumdRequest::Exists(_, reply) | GumdRequest::Delete(_, reply) => {
                let _ = reply.send(Err(error));
            }
            GumdRequest::CreateGuest(_, reply) => {
                let _ = reply.send(Err(error));
            }
            GumdRequest::HomeDir(_, reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Where the gumd thread connects to
#[derive(Debug, Clone)]
struct Target {
    address: Option<String>,
    service: String,
}

/// Guest accounts through gumd
pub struct GumdAccounts {
    request_tx: tokio::sync::mpsc::Sender<GumdRequest>,
    /// gumd thread (terminates when request_tx is dropped)
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl GumdAccounts {
    pub fn new(options: &PluginOptions) -> Self {
        let target = Target {
            address: options.get("address").filter(|a| !a.is_empty()).cloned(),
            service: options
                .get("service")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| GUMD_SERVICE.to_string()),
        };
        let (request_tx, request_rx) = tokio::sync::mpsc::channel::<GumdRequest>(16);

        let thread = std::thread::Builder::new()
            .name("seatwarden-gumd".into())
            .spawn(move || gumd_thread(request_rx, target));
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(e) => {
                warn!("Failed to start gumd thread: {}", e);
                None
            }
        };

        Self {
            request_tx,
            _thread: thread,
        }
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> GumdRequest) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.request_tx
            .try_send(make(reply_tx))
            .map_err(|e| anyhow!("gumd thread unavailable: {}", e))?;
        reply_rx
            .recv_timeout(BROKER_REPLY_TIMEOUT)
            .map_err(|_| anyhow!("gumd request timed out"))?
    }
}

impl AccountPlugin for GumdAccounts {
    fn name(&self) -> &str {
        "gumd"
    }

    fn is_valid_user(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        match self.request(|reply| GumdRequest::Exists(name.to_string(), reply)) {
            Ok(()) => true,
            Err(e) => {
                debug!("gumd: user {} not found: {:#}", name, e);
                false
            }
        }
    }

    fn setup_guest_user(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        match self.request(|reply| GumdRequest::CreateGuest(name.to_string(), reply)) {
            Ok(uid) => {
                info!("gumd: created guest user {} (uid {})", name, uid);
                true
            }
            Err(e) => {
                warn!("gumd: failed to create user {}: {:#}", name, e);
                false
            }
        }
    }

    fn cleanup_guest_user(&self, name: &str, delete: bool) -> bool {
        if name.is_empty() {
            return false;
        }
        if delete {
            return match self.request(|reply| GumdRequest::Delete(name.to_string(), reply)) {
                Ok(()) => {
                    info!("gumd: deleted user {}", name);
                    true
                }
                Err(e) => {
                    warn!("gumd: failed to delete user {}: {:#}", name, e);
                    false
                }
            };
        }
        match self.request(|reply| GumdRequest::HomeDir(name.to_string(), reply)) {
            Ok(home) => clear_home(&home),
            Err(e) => {
                warn!("gumd: failed to clean up user {}: {:#}", name, e);
                false
            }
        }
    }
}

/// gumd thread main function
fn gumd_thread(request_rx: tokio::sync::mpsc::Receiver<GumdRequest>, target: Target) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("Failed to create tokio runtime for gumd: {}", e);
            return;
        }
    };

    rt.block_on(gumd_async_main(request_rx, target));
    debug!("gumd thread terminated");
}

async fn connect(target: &Target) -> Result<zbus::Connection> {
    let connection = match &target.address {
        Some(address) => zbus::connection::Builder::address(address.as_str())?.build().await,
        None => zbus::Connection::system().await,
    };
    connection.map_err(|e| anyhow!("Failed to connect to D-Bus: {}", e))
}

/// Serve requests in order, connecting (again) whenever there is no connection
async fn gumd_async_main(mut request_rx: tokio::sync::mpsc::Receiver<GumdRequest>, target: Target) {
    let mut connection: Option<zbus::Connection> = None;

    while let Some(request) = request_rx.recv().await {
        let conn = match &connection {
            Some(conn) => conn.clone(),
            None => match connect(&target).await {
                Ok(conn) => {
                    info!("Connected to gumd bus");
                    connection = Some(conn.clone());
                    conn
                }
                Err(e) => {
                    request.fail(e);
                    continue;
                }
            },
        };

        let service = match GumUserServiceProxy::builder(&conn)
            .destination(target.service.as_str())
            .and_then(|b| b.path(GUMD_USER_SERVICE_PATH))
        {
            Ok(builder) => builder.build().await,
            Err(e) => Err(e),
        };
        let service = match service {
            Ok(service) => service,
            Err(e) => {
                request.fail(anyhow!("Failed to create gumd proxy: {}", e));
                continue;
            }
        };

        match request {
            GumdRequest::Exists(name, reply) => {
                let result = service
                    .get_user_by_name(&name)
                    .await
                    .map(|_| ())
                    .map_err(|e| anyhow!("getUserByName({}) failed: {}", name, e));
                let _ = reply.send(result);
            }
            GumdRequest::CreateGuest(name, reply) => {
                let _ = reply.send(create_guest(&conn, &target, &service, &name).await);
            }
            GumdRequest::Delete(name, reply) => {
                let result = async {
                    let user = user_proxy(&conn, &target, &service, &name).await?;
                    user.call_method("deleteUser", &(true,))
                        .await
                        .map_err(|e| anyhow!("deleteUser failed: {}", e))?;
                    Ok(())
                }
                .await;
                let _ = reply.send(result);
            }
            GumdRequest::HomeDir(name, reply) => {
                let result = async {
                    let user = user_proxy(&conn, &target, &service, &name).await?;
                    let home: String = user
                        .get_property("homedir")
                        .await
                        .map_err(|e| anyhow!("homedir lookup failed: {}", e))?;
                    Ok(PathBuf::from(home))
                }
                .await;
                let _ = reply.send(result);
            }
        }
    }
}

/// Proxy for a user object, found by name
async fn user_proxy(
    conn: &zbus::Connection,
    target: &Target,
    service: &GumUserServiceProxy<'_>,
    name: &str,
) -> Result<zbus::Proxy<'static>> {
    let path = service
        .get_user_by_name(name)
        .await
        .map_err(|e| anyhow!("getUserByName({}) failed: {}", name, e))?;
    user_at(conn, target, path).await
}

async fn user_at(
    conn: &zbus::Connection,
    target: &Target,
    path: zbus::zvariant::OwnedObjectPath,
) -> Result<zbus::Proxy<'static>> {
    let proxy = zbus::proxy::Builder::<zbus::Proxy<'static>>::new(conn)
        .destination(target.service.clone())?
        .path(path.into_inner())?
        .interface(GUMD_USER_INTERFACE)?
        .cache_properties(zbus::proxy::CacheProperties::No)
        .build()
        .await?;
    Ok(proxy)
}

async fn create_guest(
    conn: &zbus::Connection,
    target: &Target,
    service: &GumUserServiceProxy<'_>,
    name: &str,
) -> Result<u32> {
    let path = service
        .create_new_user()
        .await
        .map_err(|e| anyhow!("createNewUser failed: {}", e))?;
    let user = user_at(conn, target, path).await?;

    user.set_property("usertype", GUMD_USERTYPE_GUEST)
        .await
        .map_err(|e| anyhow!("setting usertype failed: {}", e))?;
    user.set_property("username", name)
        .await
        .map_err(|e| anyhow!("setting username failed: {}", e))?;

    let reply = user
        .call_method("addUser", &())
        .await
        .map_err(|e| anyhow!("addUser failed: {}", e))?;
    let uid: u32 = reply
        .body()
        .deserialize()
        .map_err(|e| anyhow!("addUser reply: {}", e))?;
    Ok(uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable() -> (tempfile::TempDir, GumdAccounts) {
        let dir = tempfile::tempdir().unwrap();
        let mut options = PluginOptions::new();
        options.insert(
            "address".into(),
            format!("unix:path={}", dir.path().join("no-bus").display()),
        );
        (dir, GumdAccounts::new(&options))
    }

    #[test]
    fn test_unreachable_daemon_reports_failure() {
        let (_dir, accounts) = unreachable();
        assert_eq!(accounts.name(), "gumd");
        assert!(!accounts.is_valid_user("guest0"));
        assert!(!accounts.setup_guest_user("guest0"));
        assert!(!accounts.cleanup_guest_user("guest0", false));
        assert!(!accounts.cleanup_guest_user("guest0", true));
    }

    #[test]
    fn test_empty_name_rejected_without_request() {
        let (_dir, accounts) = unreachable();
        assert!(!accounts.is_valid_user(""));
        assert!(!accounts.setup_guest_user(""));
        assert!(!accounts.cleanup_guest_user("", false));
    }

    #[test]
    fn test_default_target() {
        let accounts = GumdAccounts::new(&PluginOptions::new());
        assert_eq!(accounts.name(), "gumd");
        assert!(accounts._thread.is_some());
    }
}
