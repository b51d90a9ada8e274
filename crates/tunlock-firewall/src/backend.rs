//! Ruleset backends
//!
//! A backend knows one firewall's syntax and how to load a complete ruleset
//! file in a single transaction. The gate owns staging; backends only see
//! the final path.

use crate::dry_run::DryRunBackend;
use crate::nft::NftBackend;
use crate::pf::PfBackend;
use crate::prior::PriorState;
use crate::ruleset::Ruleset;
use crate::GateError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use tunlock_net::{CommandOutput, PrivilegeContext, run_command};

/// Firewall backend
pub trait RulesetBackend: Send {
    /// Backend name, for logs and the prior-state record
    fn name(&self) -> &'static str;

    /// File name of the staged ruleset inside the storage directory
    fn staged_file_name(&self) -> &'static str;

    /// Render the complete ruleset text
    fn render(&self, ruleset: &Ruleset) -> String;

    /// Replace the active ruleset with the staged file, atomically
    fn load(&mut self, staged: &Path) -> Result<(), GateError>;

    /// Record the host's firewall state before the session touches it
    fn capture_prior(&mut self) -> Result<PriorState, GateError>;

    /// Prior state to assume when none was recorded
    fn default_prior(&self) -> PriorState;

    /// Remove the enforced ruleset and put `prior` back
    fn restore(&mut self, prior: &PriorState) -> Result<(), GateError>;

    /// Drop connection state still tracked for `iface` after a load that
    /// no longer allows it. Backends whose established-flow handling is
    /// already bounded by the ruleset keep the default.
    fn release(&mut self, _iface: &str) -> Result<(), GateError> {
        Ok(())
    }
}

/// Which backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// pf on macOS/BSD, nftables elsewhere
    #[default]
    Auto,
    Pf,
    Nftables,
    DryRun,
}

impl BackendKind {
    /// Resolve `Auto` for this platform
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto if cfg!(any(target_os = "macos", target_os = "freebsd")) => {
                BackendKind::Pf
            }
            BackendKind::Auto => BackendKind::Nftables,
            other => other,
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BackendKind::Auto),
            "pf" => Ok(BackendKind::Pf),
            "nftables" | "nft" => Ok(BackendKind::Nftables),
            "dry-run" => Ok(BackendKind::DryRun),
            other => Err(format!("unknown firewall backend {:?}", other)),
        }
    }
}

/// Construct a backend. Every real backend requires an elevated privilege
/// token; the dry-run backend accepts any.
pub fn open_backend(
    kind: BackendKind,
    privilege: &PrivilegeContext,
    command_timeout: Duration,
) -> Result<Box<dyn RulesetBackend>, GateError> {
    Ok(match kind.resolve() {
        BackendKind::Pf => Box::new(PfBackend::new(privilege, command_timeout)?),
        BackendKind::Auto | BackendKind::Nftables => {
            Box::new(NftBackend::new(privilege, command_timeout)?)
        }
        BackendKind::DryRun => Box::new(DryRunBackend::new(privilege)),
    })
}

/// Run a firewall tool, mapping failures onto [`GateError`]
pub(crate) fn exec(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, GateError> {
    let out = run_command(program, args, timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            GateError::Timeout(format!("{} {}", program, args.join(" ")))
        } else {
            GateError::Io(e)
        }
    })?;

    if !out.success() {
        return Err(GateError::Command {
            program: program.to_string(),
            status: out.status.to_string(),
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out)
}
