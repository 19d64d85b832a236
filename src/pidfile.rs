//! The pidfile: a decimal pid followed by a newline, and the only durable state.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::PidFileError;

/// Handle on a pidfile path. Holds no cached pid; every read goes to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the tracked pid. A missing, empty, unreadable or non-numeric
    /// file all mean "nothing tracked".
    pub fn read(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match contents.trim().parse::<u32>() {
            Ok(0) => None,
            Ok(pid) => Some(pid),
            Err(_) => {
                debug!("ignoring unparseable pidfile {}", self.path.display());
                None
            }
        }
    }

    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        let to_error = |source| PidFileError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(to_error)?;
        }
        fs::write(&self.path, format!("{pid}\n")).map_err(to_error)?;
        debug!("created pidfile {}", self.path.display());
        Ok(())
    }

    /// Deletes the pidfile; an already-missing file is not an error.
    pub fn remove(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Removes the pidfile when dropped. Held by a daemonized payload so the file
/// disappears on normal exit.
#[derive(Debug)]
pub struct PidFileGuard {
    pidfile: PidFile,
    pid: u32,
}

impl PidFileGuard {
    pub fn new(pidfile: PidFile, pid: u32) -> Self {
        Self { pidfile, pid }
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        // Only clean up if nobody has taken the pidfile over since.
        if self.pidfile.read() == Some(self.pid) {
            let _ = self.pidfile.remove();
        }
    }
}
