//! Single-instance pidfile
//!
//! `tunlock.pid` in the storage directory. A pidfile only counts if the
//! PID it names is a live tunlock process; anything else is stale and is
//! overwritten.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

const PIDFILE: &str = "tunlock.pid";

#[derive(Debug, thiserror::Error)]
pub enum PidfileError {
    #[error("tunlock is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("pidfile I/O: {0}")]
    Io(#[from] io::Error),
}

/// Held for the lifetime of a running governor; removed on drop
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn path(storage: &Path) -> PathBuf {
        storage.join(PIDFILE)
    }

    /// Claim the pidfile for this process
    pub fn acquire(storage: &Path) -> Result<Self, PidfileError> {
        let path = Self::path(storage);
        if let Some(pid) = Self::read(storage)? {
            if pid != std::process::id() && is_tunlock_process(pid) {
                return Err(PidfileError::AlreadyRunning(pid));
            }
            warn!("Replacing stale pidfile (pid {})", pid);
        }

        fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!("Wrote {}", path.display());
        Ok(Self { path })
    }

    /// PID recorded in the pidfile, if any
    pub fn read(storage: &Path) -> io::Result<Option<u32>> {
        match fs::read_to_string(Self::path(storage)) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// PID of the live governor, ignoring stale pidfiles
    pub fn running(storage: &Path) -> io::Result<Option<u32>> {
        Ok(Self::read(storage)?.filter(|pid| is_tunlock_process(*pid)))
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Could not remove pidfile: {}", e);
        }
    }
}

/// Check if `pid` is a live process whose name starts with "tunlock"
pub fn is_tunlock_process(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );

    system
        .process(pid)
        .map(|p| p.name().to_string_lossy().starts_with("tunlock"))
        .unwrap_or(false)
}
