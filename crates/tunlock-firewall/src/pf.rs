//! pf backend (macOS / BSD)
//!
//! The staged file replaces the main ruleset with `pfctl -f`, which pf
//! applies as a single transaction. Restore reloads the system ruleset
//! (`/etc/pf.conf`) and disables pf again if it was off before the session.
//!
//! `pfctl -f` keeps the state table, so flows admitted by `pass ... keep
//! state` on a tunnel would outlive the ruleset that admitted them. The gate
//! calls [`RulesetBackend::release`] after such a load and the interface's
//! states are flushed.

use crate::backend::{RulesetBackend, exec};
use crate::prior::PriorState;
use crate::ruleset::Ruleset;
use crate::GateError;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tunlock_net::PrivilegeContext;

const PFCTL: &str = "pfctl";
const SYSTEM_RULESET: &str = "/etc/pf.conf";

/// pf ruleset backend
pub struct PfBackend {
    timeout: Duration,
    /// pf known to be enabled (by the host or by us)
    enabled: bool,
}

impl PfBackend {
    pub fn new(privilege: &PrivilegeContext, timeout: Duration) -> Result<Self, GateError> {
        if !privilege.is_elevated() {
            return Err(GateError::Privilege("pf"));
        }
        if !cfg!(any(target_os = "macos", target_os = "freebsd")) {
            return Err(GateError::Unsupported("pf".to_string()));
        }
        Ok(Self {
            timeout,
            enabled: false,
        })
    }

    fn is_enabled(&self) -> Result<bool, GateError> {
        let out = exec(PFCTL, &["-s", "info"], self.timeout)?;
        Ok(parse_pf_status(&out.stdout))
    }

    fn enable(&mut self) -> Result<(), GateError> {
        match exec(PFCTL, &["-e"], self.timeout) {
            Ok(_) => {}
            Err(GateError::Command { stderr, .. }) if stderr.contains("already enabled") => {}
            Err(e) => return Err(e),
        }
        self.enabled = true;
        info!("pf enabled");
        Ok(())
    }
}

impl RulesetBackend for PfBackend {
    fn name(&self) -> &'static str {
        "pf"
    }

    fn staged_file_name(&self) -> &'static str {
        "tunlock.pf.conf"
    }

    fn render(&self, ruleset: &Ruleset) -> String {
        render_pf(ruleset)
    }

    fn load(&mut self, staged: &Path) -> Result<(), GateError> {
        let path = staged.to_string_lossy();
        exec(PFCTL, &["-f", &path], self.timeout)?;

        // Load before enabling so pf never runs without our ruleset
        if !self.enabled {
            self.enable()?;
        }
        Ok(())
    }

    fn capture_prior(&mut self) -> Result<PriorState, GateError> {
        let enabled = self.is_enabled()?;
        self.enabled = enabled;
        debug!("pf was {} before session", if enabled { "enabled" } else { "disabled" });

        let restore = Path::new(SYSTEM_RULESET)
            .exists()
            .then(|| PathBuf::from(SYSTEM_RULESET));
        Ok(PriorState::new(self.name(), enabled, restore))
    }

    fn release(&mut self, iface: &str) -> Result<(), GateError> {
        exec(PFCTL, &release_args(iface), self.timeout)?;
        debug!("Flushed pf states on {}", iface);
        Ok(())
    }

    fn default_prior(&self) -> PriorState {
        PriorState::new(self.name(), true, Some(PathBuf::from(SYSTEM_RULESET)))
    }

    fn restore(&mut self, prior: &PriorState) -> Result<(), GateError> {
        match &prior.restore_ruleset {
            Some(path) => {
                let path = path.to_string_lossy();
                exec(PFCTL, &["-f", &path], self.timeout)?;
            }
            None => {
                exec(PFCTL, &["-F", "rules"], self.timeout)?;
            }
        }

        if !prior.firewall_enabled {
            match exec(PFCTL, &["-d"], self.timeout) {
                Ok(_) => {}
                Err(GateError::Command { stderr, .. }) if stderr.contains("not enabled") => {}
                Err(e) => return Err(e),
            }
            self.enabled = false;
            info!("pf disabled");
        }
        Ok(())
    }
}

/// Render a complete pf main ruleset
pub fn render_pf(ruleset: &Ruleset) -> String {
    let a = &ruleset.allowances;
    let mut out = String::new();

    let _ = writeln!(out, "# tunlock: {}", ruleset.target);
    let _ = writeln!(out, "set block-policy drop");
    let _ = writeln!(out, "set skip on lo0");
    let _ = writeln!(out, "block drop all");
    let _ = writeln!(out, "pass out quick proto {{ udp tcp }} to any port 53 keep state");
    let _ = writeln!(out, "pass out quick proto udp to any port {} keep state", a.handshake_port);
    let _ = writeln!(out, "pass out quick proto udp from any port {} keep state", a.handshake_port);
    if a.allow_dhcp {
        let _ = writeln!(out, "pass quick proto udp from any port 68 to any port 67 keep state");
        let _ = writeln!(out, "pass in quick proto udp from any port 67 to any port 68");
    }
    if a.allow_icmp {
        let _ = writeln!(out, "pass quick inet proto icmp all keep state");
        let _ = writeln!(out, "pass quick inet6 proto icmp6 all keep state");
    }
    if let Some(iface) = ruleset.target.interface() {
        let _ = writeln!(out, "pass quick on {} all keep state", iface);
    }
    out
}

/// `pfctl` arguments flushing every state created on `iface`
fn release_args(iface: &str) -> [&str; 4] {
    ["-i", iface, "-F", "states"]
}

/// Extract pf enablement from `pfctl -s info` ("Status: Enabled ...")
fn parse_pf_status(info: &str) -> bool {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("Status:"))
        .map(|rest| rest.trim_start().starts_with("Enabled"))
        .unwrap_or(false)
}
