//! Read-only user database lookups

use std::ffi::CString;
use std::path::PathBuf;

use log::{debug, warn};
use nix::unistd::{getgrouplist, Gid, User};

/// Account details needed to start a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    /// Login shell (empty if none configured)
    pub shell: String,
}

/// User database collaborator
pub trait UserDb {
    fn lookup(&self, name: &str) -> Option<UserRecord>;

    /// Supplementary group ids, including the primary group
    fn supplementary_groups(&self, user: &UserRecord) -> Vec<u32> {
        vec![user.gid]
    }

    fn get_home_dir(&self, name: &str) -> Option<PathBuf> {
        self.lookup(name).map(|u| u.home)
    }

    fn get_shell(&self, name: &str) -> Option<String> {
        self.lookup(name).map(|u| u.shell).filter(|s| !s.is_empty())
    }

    fn get_uid(&self, name: &str) -> Option<u32> {
        self.lookup(name).map(|u| u.uid)
    }

    fn get_gid(&self, name: &str) -> Option<u32> {
        self.lookup(name).map(|u| u.gid)
    }
}

/// passwd/group database via getpwnam_r and getgrouplist
#[derive(Debug, Default, Clone, Copy)]
pub struct PasswdDb;

impl UserDb for PasswdDb {
    fn lookup(&self, name: &str) -> Option<UserRecord> {
        match User::from_name(name) {
            Ok(Some(user)) => Some(UserRecord {
                name: user.name,
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
                home: user.dir,
                shell: user.shell.to_string_lossy().into_owned(),
            }),
            Ok(None) => None,
            Err(e) => {
                debug!("getpwnam({}) failed: {}", name, e);
                None
            }
        }
    }

    fn supplementary_groups(&self, user: &UserRecord) -> Vec<u32> {
        let Ok(name) = CString::new(user.name.as_str()) else {
            return vec![user.gid];
        };
        match getgrouplist(&name, Gid::from_raw(user.gid)) {
            Ok(groups) => groups.into_iter().map(|g| g.as_raw()).collect(),
            Err(e) => {
                warn!("getgrouplist({}) failed: {}", user.name, e);
                vec![user.gid]
            }
        }
    }
}
