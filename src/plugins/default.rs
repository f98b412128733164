//! Accounts plugin backed by the system's user tools

use std::path::Path;
use std::process::Command;

use log::{info, warn};

use super::AccountPlugin;
use crate::utils::{PasswdDb, UserDb};

/// Guest accounts through useradd/userdel
pub struct SystemAccounts {
    users: PasswdDb,
}

impl SystemAccounts {
    pub fn new() -> Self {
        Self { users: PasswdDb }
    }

    fn run(program: &str, args: &[&str]) -> bool {
        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("{} {:?} failed: {}", program, args, status);
                false
            }
            Err(e) => {
                warn!("Failed to run {}: {}", program, e);
                false
            }
        }
    }
}

impl Default for SystemAccounts {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove everything inside `home`, keeping the directory itself
pub(super) fn clear_home(home: &Path) -> bool {
    if home.as_os_str().is_empty() || home == Path::new("/") {
        warn!("Refusing to clear home {:?}", home);
        return false;
    }
    let entries = match std::fs::read_dir(home) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read {}: {}", home.display(), e);
            return false;
        }
    };

    let mut ok = true;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!("Failed to remove {}: {}", path.display(), e);
            ok = false;
        }
    }
    ok
}

impl AccountPlugin for SystemAccounts {
    fn name(&self) -> &str {
        "default"
    }

    fn is_valid_user(&self, name: &str) -> bool {
        self.users.lookup(name).is_some()
    }

    fn setup_guest_user(&self, name: &str) -> bool {
        info!("Creating guest user {}", name);
        Self::run("useradd", &["-m", name])
    }

    fn cleanup_guest_user(&self, name: &str, delete: bool) -> bool {
        if delete {
            info!("Deleting guest user {}", name);
            return Self::run("userdel", &["-r", name]);
        }
        match self.users.get_home_dir(name) {
            Some(home) => clear_home(&home),
            None => {
                warn!("No home directory for {}", name);
                false
            }
        }
    }
}
