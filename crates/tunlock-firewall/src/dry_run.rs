//! Dry-run backend
//!
//! Stages rulesets exactly like a real backend, in the platform's syntax,
//! but never loads them. The only backend an unprivileged token may open.

use crate::backend::RulesetBackend;
use crate::nft::render_nft;
use crate::pf::render_pf;
use crate::prior::PriorState;
use crate::ruleset::Ruleset;
use crate::GateError;
use std::path::Path;
use tracing::info;
use tunlock_net::PrivilegeContext;

/// Backend that logs instead of loading
pub struct DryRunBackend {
    pf_syntax: bool,
    loads: usize,
}

impl DryRunBackend {
    pub fn new(_privilege: &PrivilegeContext) -> Self {
        Self {
            pf_syntax: cfg!(any(target_os = "macos", target_os = "freebsd")),
            loads: 0,
        }
    }

    /// Number of rulesets that would have been loaded
    pub fn loads(&self) -> usize {
        self.loads
    }
}

impl RulesetBackend for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn staged_file_name(&self) -> &'static str {
        if self.pf_syntax {
            "tunlock.pf.conf"
        } else {
            "tunlock.nft"
        }
    }

    fn render(&self, ruleset: &Ruleset) -> String {
        if self.pf_syntax {
            render_pf(ruleset)
        } else {
            render_nft(ruleset)
        }
    }

    fn load(&mut self, staged: &Path) -> Result<(), GateError> {
        // Surface staging problems the same way a real load would
        std::fs::metadata(staged)?;
        self.loads += 1;
        info!("[dry-run] would load {}", staged.display());
        Ok(())
    }

    fn capture_prior(&mut self) -> Result<PriorState, GateError> {
        Ok(self.default_prior())
    }

    fn default_prior(&self) -> PriorState {
        PriorState::new(self.name(), false, None)
    }

    fn restore(&mut self, _prior: &PriorState) -> Result<(), GateError> {
        info!("[dry-run] would restore prior firewall state");
        Ok(())
    }

    fn release(&mut self, iface: &str) -> Result<(), GateError> {
        info!("[dry-run] would flush connection state on {}", iface);
        Ok(())
    }
}
