//! Privilege Capability
//!
//! Interface enumeration and ruleset loading require root. Rather than
//! checking the effective uid wherever it matters, the process acquires a
//! [`PrivilegeContext`] once at startup and passes it to every component
//! that touches the host. Holding one is the proof.

use nix::unistd::geteuid;
use tracing::{debug, info};

/// What the holder of a [`PrivilegeContext`] is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    /// Effective root: may load rulesets and query every interface
    Root,
    /// Unprivileged: only staging rulesets to disk is allowed
    DryRun,
}

/// Privilege errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrivilegeError {
    #[error("root privileges required (effective uid is {euid}); re-run with sudo")]
    NotRoot { euid: u32 },
}

/// Capability token for privileged host access
#[derive(Debug, Clone)]
pub struct PrivilegeContext {
    level: PrivilegeLevel,
    euid: u32,
}

impl PrivilegeContext {
    /// Acquire root privileges, or fail if the process is not running as root
    pub fn acquire() -> Result<Self, PrivilegeError> {
        let euid = geteuid();
        if !euid.is_root() {
            debug!("Privilege check failed (euid {})", euid);
            return Err(PrivilegeError::NotRoot {
                euid: euid.as_raw(),
            });
        }

        info!("Running with root privileges");
        Ok(Self {
            level: PrivilegeLevel::Root,
            euid: euid.as_raw(),
        })
    }

    /// Unprivileged token for dry-run sessions
    pub fn dry_run() -> Self {
        Self {
            level: PrivilegeLevel::DryRun,
            euid: geteuid().as_raw(),
        }
    }

    pub fn level(&self) -> PrivilegeLevel {
        self.level
    }

    /// Check if this token grants root access
    pub fn is_elevated(&self) -> bool {
        self.level == PrivilegeLevel::Root
    }

    pub fn euid(&self) -> u32 {
        self.euid
    }
}
