//! Privilege and session helpers applied to a payload before it runs.
use std::{collections::HashMap, io, path::PathBuf};

use libc::id_t;
use nix::unistd::{Group, User, getuid};

use crate::error::SupervisorError;

/// Target account a payload switches to, resolved in the supervisor before
/// any fork so lookup failures reach the caller.
#[derive(Debug, Clone)]
pub struct Credentials {
    uid: libc::uid_t,
    gid: libc::gid_t,
    username: String,
    home: PathBuf,
}

impl Credentials {
    /// Looks up `user` (and optionally overrides its primary group).
    pub fn lookup(user: &str, group: Option<&str>) -> Result<Self, SupervisorError> {
        let account = User::from_name(user)
            .map_err(|err| SupervisorError::User(err.to_string()))?
            .ok_or_else(|| SupervisorError::User(format!("user '{user}' not found")))?;

        let mut gid = account.gid.as_raw();
        if let Some(group_name) = group {
            let group = Group::from_name(group_name)
                .map_err(|err| SupervisorError::User(err.to_string()))?
                .ok_or_else(|| {
                    SupervisorError::User(format!("group '{group_name}' not found"))
                })?;
            gid = group.gid.as_raw();
        }

        if !getuid().is_root() && account.uid != getuid() {
            return Err(SupervisorError::User(format!(
                "switching to user '{user}' requires running as root"
            )));
        }

        Ok(Self {
            uid: account.uid.as_raw(),
            gid,
            username: account.name,
            home: account.dir,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Environment a payload should see once running as this account.
    pub fn env_overrides(&self) -> HashMap<String, String> {
        HashMap::from([
            ("HOME".to_string(), self.home.display().to_string()),
            ("USER".to_string(), self.username.clone()),
            ("LOGNAME".to_string(), self.username.clone()),
        ])
    }

    /// Drops to the target gid then uid.
    ///
    /// # Safety
    /// Call this only in a freshly forked child (before `exec` or before the
    /// payload runs). Only async-signal-safe calls are made.
    pub unsafe fn apply(&self) -> io::Result<()> {
        unsafe {
            if libc::geteuid() == 0 && libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(self.gid as id_t) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(self.uid as id_t) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Leaves the launching session: new session without a controlling terminal,
/// working directory `/`, cleared umask.
///
/// # Safety
/// Call this only in a forked child. Only async-signal-safe calls are made.
pub unsafe fn detach_session() -> io::Result<()> {
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::chdir(c"/".as_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::umask(0);
    }
    Ok(())
}
