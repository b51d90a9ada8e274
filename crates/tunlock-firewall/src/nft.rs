//! nftables backend (Linux)
//!
//! All rules live in a dedicated `inet tunlock` table. The staged file
//! declares, deletes and redefines that table, and `nft -f` applies the
//! whole file as one transaction, so the old and new rulesets are never
//! both absent. Restore deletes the table.

use crate::backend::{RulesetBackend, exec};
use crate::prior::PriorState;
use crate::ruleset::Ruleset;
use crate::GateError;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tunlock_net::PrivilegeContext;

const NFT: &str = "nft";
const TABLE: &str = "tunlock";

/// nftables ruleset backend
pub struct NftBackend {
    timeout: Duration,
}

impl NftBackend {
    pub fn new(privilege: &PrivilegeContext, timeout: Duration) -> Result<Self, GateError> {
        if !privilege.is_elevated() {
            return Err(GateError::Privilege("nftables"));
        }
        if !cfg!(target_os = "linux") {
            return Err(GateError::Unsupported("nftables".to_string()));
        }
        Ok(Self { timeout })
    }

    fn table_exists(&self) -> Result<bool, GateError> {
        let out = exec(NFT, &["list", "tables"], self.timeout)?;
        Ok(out
            .stdout
            .lines()
            .any(|line| line.trim() == format!("table inet {}", TABLE)))
    }
}

impl RulesetBackend for NftBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn staged_file_name(&self) -> &'static str {
        "tunlock.nft"
    }

    fn render(&self, ruleset: &Ruleset) -> String {
        render_nft(ruleset)
    }

    fn load(&mut self, staged: &Path) -> Result<(), GateError> {
        let path = staged.to_string_lossy();
        exec(NFT, &["-f", &path], self.timeout)?;
        Ok(())
    }

    fn capture_prior(&mut self) -> Result<PriorState, GateError> {
        // nftables has no global switch; a leftover table means a crashed
        // session, which restore removes either way
        if self.table_exists()? {
            info!("Found leftover inet {} table from a previous session", TABLE);
        }
        Ok(self.default_prior())
    }

    fn default_prior(&self) -> PriorState {
        PriorState::new(self.name(), true, None)
    }

    fn restore(&mut self, _prior: &PriorState) -> Result<(), GateError> {
        if !self.table_exists()? {
            return Ok(());
        }
        exec(NFT, &["delete", "table", "inet", TABLE], self.timeout)?;
        info!("Removed inet {} table", TABLE);
        Ok(())
    }
}

/// Render a complete nft script that atomically replaces the tunlock table
pub fn render_nft(ruleset: &Ruleset) -> String {
    let a = &ruleset.allowances;
    let mut out = String::new();

    let _ = writeln!(out, "# tunlock: {}", ruleset.target);
    // Declaring first makes the delete valid when the table doesn't exist yet
    let _ = writeln!(out, "table inet {} {{}}", TABLE);
    let _ = writeln!(out, "delete table inet {}", TABLE);
    let _ = writeln!(out, "table inet {} {{", TABLE);

    let _ = writeln!(out, "    chain input {{");
    let _ = writeln!(out, "        type filter hook input priority 0; policy drop;");
    let _ = writeln!(out, "        iif \"lo\" accept");
    let _ = writeln!(out, "        ct state established,related accept");
    let _ = writeln!(out, "        udp sport {} accept", a.handshake_port);
    if a.allow_dhcp {
        let _ = writeln!(out, "        udp sport 67 udp dport 68 accept");
    }
    if a.allow_icmp {
        let _ = writeln!(out, "        meta l4proto {{ icmp, ipv6-icmp }} accept");
    }
    if let Some(iface) = ruleset.target.interface() {
        let _ = writeln!(out, "        iifname \"{}\" accept", iface);
    }
    let _ = writeln!(out, "    }}");

    let _ = writeln!(out, "    chain output {{");
    let _ = writeln!(out, "        type filter hook output priority 0; policy drop;");
    let _ = writeln!(out, "        oif \"lo\" accept");
    let _ = writeln!(out, "        udp dport 53 accept");
    let _ = writeln!(out, "        tcp dport 53 accept");
    let _ = writeln!(out, "        udp dport {} accept", a.handshake_port);
    let _ = writeln!(out, "        udp sport {} accept", a.handshake_port);
    if a.allow_dhcp {
        let _ = writeln!(out, "        udp sport 68 udp dport 67 accept");
    }
    if a.allow_icmp {
        let _ = writeln!(out, "        meta l4proto {{ icmp, ipv6-icmp }} accept");
    }
    if let Some(iface) = ruleset.target.interface() {
        let _ = writeln!(out, "        oifname \"{}\" accept", iface);
    }
    let _ = writeln!(out, "    }}");

    let _ = writeln!(out, "}}");
    out
}
