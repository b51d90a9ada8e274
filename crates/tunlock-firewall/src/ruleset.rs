//! Ruleset model
//!
//! A [`Ruleset`] is the complete intent for one apply: the target
//! [`GateState`] plus the always-allowed [`Allowances`]. Backends turn it
//! into pf or nftables syntax; nothing here touches the host.

use crate::GateError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const MAX_INTERFACE_NAME: usize = 15;

/// Firewall posture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "interface", rename_all = "snake_case")]
pub enum GateState {
    /// Deny-all plus the always-allowed set
    Locked,
    /// Deny-all except through one interface
    Unlocked(String),
}

impl GateState {
    /// Interface traffic is allowed through, if any
    pub fn interface(&self) -> Option<&str> {
        match self {
            GateState::Locked => None,
            GateState::Unlocked(iface) => Some(iface),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, GateState::Locked)
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Locked => write!(f, "Locked"),
            GateState::Unlocked(iface) => write!(f, "Unlocked({})", iface),
        }
    }
}

/// Traffic that passes regardless of the gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allowances {
    /// VPN handshake port; UDP to and from it is always allowed
    pub handshake_port: u16,
    /// DHCP client traffic (udp 68 -> 67)
    pub allow_dhcp: bool,
    /// ICMP and ICMPv6
    pub allow_icmp: bool,
}

impl Allowances {
    /// Loopback, DNS and the handshake port only
    pub fn minimal(handshake_port: u16) -> Self {
        Self {
            handshake_port,
            allow_dhcp: false,
            allow_icmp: false,
        }
    }
}

/// Everything a backend needs to render one ruleset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    pub target: GateState,
    pub allowances: Allowances,
}

impl Ruleset {
    /// Build a ruleset, rejecting interface names that could not be safely
    /// spliced into firewall syntax
    pub fn new(target: GateState, allowances: Allowances) -> Result<Self, GateError> {
        if let Some(iface) = target.interface() {
            validate_interface_name(iface)?;
        }
        Ok(Self { target, allowances })
    }
}

/// Check an interface name: 1-15 characters of `[A-Za-z0-9._-]`
pub fn validate_interface_name(name: &str) -> Result<(), GateError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(GateError::InvalidInterface(name.to_string()))
    }
}
