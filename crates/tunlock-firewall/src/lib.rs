//! tunlock firewall gate
//!
//! Owns the host firewall posture for the kill switch:
//!
//! - [`GateState`]: `Locked` (deny-all) or `Unlocked(iface)`
//! - [`FirewallGate`]: idempotent, atomic lock/unlock plus cleanup
//! - [`RulesetBackend`]: pf, nftables and dry-run renderers/loaders
//! - [`PriorState`]: what to restore when the session ends
//!
//! Whatever the state, loopback, DNS and the VPN handshake port stay open;
//! DHCP and ICMP only when the [`Allowances`] ask for them.

mod backend;
mod dry_run;
mod error;
mod gate;
mod nft;
mod pf;
mod prior;
mod ruleset;

pub use backend::{BackendKind, RulesetBackend, open_backend};
pub use dry_run::DryRunBackend;
pub use error::GateError;
pub use gate::FirewallGate;
pub use nft::{NftBackend, render_nft};
pub use pf::{PfBackend, render_pf};
pub use prior::PriorState;
pub use ruleset::{Allowances, GateState, Ruleset, validate_interface_name};
