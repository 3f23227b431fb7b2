//! Session Registry
//!
//! Tracks the one session allowed per host through a JSON status file.
//! Records whose process has exited are purged on read.

use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::status::{Role, SessionStatus};
use crate::error::{Error, Result};

/// Answers whether a process id is still alive
pub trait ProcessLiveness {
    fn exists(&self, pid: u32) -> bool;
}

/// Liveness plus the ability to ask a process to terminate
pub trait ProcessControl: ProcessLiveness {
    /// Send a termination request. `Ok(false)` means the process was
    /// already gone.
    fn terminate(&self, pid: u32) -> Result<bool>;
}

/// The host's process table, probed with signals
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

fn pid_of(pid: u32) -> Option<Pid> {
    // 0 and negative pids address process groups
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

impl ProcessLiveness for SystemProcesses {
    fn exists(&self, pid: u32) -> bool {
        let Some(pid) = pid_of(pid) else {
            return false;
        };
        match signal::kill(pid, None) {
            Ok(()) => true,
            // Alive but owned by another user
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn terminate(&self, pid: u32) -> Result<bool> {
        let Some(target) = pid_of(pid) else {
            return Ok(false);
        };
        match signal::kill(target, Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => Err(Error::PermissionDenied(format!(
                "not allowed to signal process {}; try again with sudo",
                pid
            ))),
            Err(e) => Err(Error::Io(std::io::Error::from(e))),
        }
    }
}

/// Persisted session record with stale-record detection
#[derive(Debug, Clone)]
pub struct SessionRegistry<P = SystemProcesses> {
    path: PathBuf,
    processes: P,
}

impl SessionRegistry<SystemProcesses> {
    /// Registry at `path` probing the real process table
    pub fn system(path: impl Into<PathBuf>) -> Self {
        Self::new(path, SystemProcesses)
    }
}

impl<P: ProcessLiveness> SessionRegistry<P> {
    pub fn new(path: impl Into<PathBuf>, processes: P) -> Self {
        Self {
            path: path.into(),
            processes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn processes(&self) -> &P {
        &self.processes
    }

    /// Active session, if any.
    ///
    /// A record whose process no longer exists is deleted. With
    /// `expected_role`, a live record of the other role reports inactive
    /// and is left in place.
    pub fn status(&self, expected_role: Option<Role>) -> Result<Option<SessionStatus>> {
        let Some(record) = self.last_record()? else {
            return Ok(None);
        };

        if !self.processes.exists(record.process_id) {
            tracing::info!(
                "Removing stale {} session record (PID {} is gone)",
                record.role,
                record.process_id
            );
            self.clear_owned(record.process_id)?;
            return Ok(None);
        }

        match expected_role {
            Some(role) if role != record.role => Ok(None),
            _ => Ok(Some(record)),
        }
    }

    /// Read the record as stored, without checking liveness
    pub fn last_record(&self) -> Result<Option<SessionStatus>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable session record {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    /// Replace the record atomically, creating the directory if needed
    pub fn save(&self, record: &SessionStatus) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, record)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved {} session record for PID {}", record.role, record.process_id);
        Ok(())
    }

    /// Delete the record only if `pid` owns it. Returns whether it was
    /// deleted; a record saved since by another session is left alone.
    pub fn clear_owned(&self, pid: u32) -> Result<bool> {
        match self.last_record()? {
            Some(record) if record.process_id == pid => {
                self.clear()?;
                Ok(true)
            }
            Some(record) => {
                tracing::debug!(
                    "Leaving {} session record of PID {} in place",
                    record.role,
                    record.process_id
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Delete the record; absent is not an error
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
