//! Firewall Gate
//!
//! Owns the active ruleset. The governor only asks for [`FirewallGate::lock`]
//! or [`FirewallGate::unlock`]; the gate decides whether anything needs to
//! be applied and records the new state only once the backend confirms it.
//!
//! # Apply Sequence
//!
//! ```text
//! render ──▶ write .tmp ──▶ fsync ──▶ rename over staged file ──▶ backend.load()
//! ```
//!
//! The backend load is a single transaction, so an observer sees either the
//! previous ruleset or the new one, never neither and never both. Once a
//! load stops allowing an interface, the backend releases the connection
//! state it still tracks for it.

use crate::backend::RulesetBackend;
use crate::prior::{PriorState, write_atomic};
use crate::ruleset::{Allowances, GateState, Ruleset, validate_interface_name};
use crate::GateError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Kill-switch firewall gate
pub struct FirewallGate {
    backend: Box<dyn RulesetBackend>,
    storage: PathBuf,
    allowances: Allowances,
    /// Last successfully applied state; `None` until the first apply
    state: Option<GateState>,
    /// Host state captured by [`FirewallGate::begin`]
    prior: Option<PriorState>,
}

impl FirewallGate {
    /// Create a gate staging rulesets under `storage`
    pub fn new(
        backend: Box<dyn RulesetBackend>,
        storage: impl Into<PathBuf>,
        allowances: Allowances,
    ) -> Result<Self, GateError> {
        let storage = storage.into();
        fs::create_dir_all(&storage)?;
        Ok(Self {
            backend,
            storage,
            allowances,
            state: None,
            prior: None,
        })
    }

    /// Capture and persist the host's firewall state before the first apply.
    ///
    /// If a state file survives from a session that never cleaned up, it is
    /// kept: the live firewall is then ours, not the host's.
    pub fn begin(&mut self) -> Result<(), GateError> {
        let prior = match PriorState::load(&self.storage)? {
            Some(existing) if existing.backend == self.backend.name() => {
                warn!(
                    "Reusing prior firewall state from an unclean session (captured at {})",
                    existing.captured_at
                );
                existing
            }
            _ => {
                let captured = self.backend.capture_prior()?;
                captured.save(&self.storage)?;
                captured
            }
        };
        self.prior = Some(prior);
        Ok(())
    }

    /// Last successfully applied state
    pub fn state(&self) -> Option<&GateState> {
        self.state.as_ref()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Path of the staged ruleset file
    pub fn staged_path(&self) -> PathBuf {
        self.storage.join(self.backend.staged_file_name())
    }

    /// Deny-all plus the always-allowed set. No-op when already Locked.
    pub fn lock(&mut self) -> Result<(), GateError> {
        if self.state == Some(GateState::Locked) {
            return Ok(());
        }
        self.apply(GateState::Locked)
    }

    /// Deny-all except through `iface`. No-op when already unlocked for it.
    ///
    /// Switching from another interface locks first, so two interfaces are
    /// never allowed by the same ruleset.
    pub fn unlock(&mut self, iface: &str) -> Result<(), GateError> {
        validate_interface_name(iface)?;

        match &self.state {
            Some(GateState::Unlocked(current)) if current == iface => return Ok(()),
            Some(GateState::Unlocked(current)) => {
                info!("Switching tunnel interface {} -> {}", current, iface);
                self.apply(GateState::Locked)?;
            }
            _ => {}
        }
        self.apply(GateState::Unlocked(iface.to_string()))
    }

    /// Remove the enforced ruleset and restore the host's prior state.
    ///
    /// Falls back to the persisted state file, then to the backend default,
    /// so it also works in a fresh process after a crash.
    pub fn cleanup(&mut self) -> Result<(), GateError> {
        let prior = match self.prior.clone() {
            Some(prior) => prior,
            None => match PriorState::load(&self.storage)? {
                Some(recorded) if recorded.backend == self.backend.name() => recorded,
                Some(recorded) => {
                    warn!(
                        "Prior state was recorded by {}, not {}; using backend default",
                        recorded.backend,
                        self.backend.name()
                    );
                    self.backend.default_prior()
                }
                None => {
                    debug!("No recorded prior state, using {} default", self.backend.name());
                    self.backend.default_prior()
                }
            },
        };

        self.backend.restore(&prior)?;
        info!("Firewall restored to pre-session state");

        self.state = None;
        self.prior = None;
        PriorState::remove(&self.storage)?;
        remove_if_present(&self.staged_path())?;
        Ok(())
    }

    fn apply(&mut self, target: GateState) -> Result<(), GateError> {
        let ruleset = Ruleset::new(target, self.allowances)?;
        let text = self.backend.render(&ruleset);
        let staged = self.staged_path();

        write_atomic(&staged, text.as_bytes())?;
        self.backend.load(&staged)?;

        info!("Firewall {} ({})", ruleset.target, self.backend.name());
        let previous = self.state.replace(ruleset.target);

        if let Some(GateState::Unlocked(old)) = previous {
            if self.state.as_ref().and_then(GateState::interface) != Some(old.as_str()) {
                // The new ruleset is in force either way; stale flows are logged
                if let Err(e) = self.backend.release(&old) {
                    warn!("Could not flush connection state on {}: {}", old, e);
                }
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<(), GateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
