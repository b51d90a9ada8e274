//! Connectivity Classifier
//!
//! Maps a [`SelectionResult`] to a [`ConnectionState`], then debounces
//! transitions into Connected.
//!
//! | source            | exists | routable | MTU ok | state                |
//! |-------------------|--------|----------|--------|----------------------|
//! | Unresolved        | -      | -        | -      | Disconnected         |
//! | Detected/Fallback | no     | -        | -      | Disconnected         |
//! | Detected/Fallback | yes    | no       | -      | Disconnected         |
//! | Detected          | yes    | yes      | yes    | Connected (Verified) |
//! | Fallback          | yes    | yes      | yes    | Connected (Reduced)  |
//! | any               | yes    | yes      | no     | Degraded             |

use crate::selector::{SelectionResult, SelectionSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use tunlock_net::Fingerprint;

/// How much the interface identification can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    /// Fingerprint fully matched
    Verified,
    /// Chosen by name only
    Reduced,
}

/// Connection state for one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected { interface: String, trust: Trust },
    Disconnected,
    /// Interface is up with an address, but its fingerprint is off
    Degraded { interface: String, mtu: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Degraded { .. })
    }

    /// Interface a Connected state allows traffic through
    pub fn connected_interface(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected { interface, .. } => Some(interface),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected { interface, trust } => {
                write!(f, "Connected({}, {:?})", interface, trust)
            }
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Degraded { interface, mtu } => {
                write!(f, "Degraded({}, mtu {})", interface, mtu)
            }
        }
    }
}

/// Classify one selection against the fingerprint
pub fn classify(selection: &SelectionResult, fingerprint: &Fingerprint) -> ConnectionState {
    let Some(candidate) = &selection.interface else {
        return ConnectionState::Disconnected;
    };

    if !candidate.has_routable_address {
        return ConnectionState::Disconnected;
    }

    if !candidate.mtu_matches(fingerprint) {
        return ConnectionState::Degraded {
            interface: candidate.name.clone(),
            mtu: candidate.mtu,
        };
    }

    let trust = match selection.source {
        SelectionSource::Detected => Trust::Verified,
        SelectionSource::Fallback => Trust::Reduced,
        SelectionSource::Unresolved => return ConnectionState::Disconnected,
    };

    ConnectionState::Connected {
        interface: candidate.name.clone(),
        trust,
    }
}

/// Requires Connected to hold for several consecutive ticks on the same
/// interface before reporting it. Anything else passes through at once.
#[derive(Debug, Clone)]
pub struct Debouncer {
    verified_ticks: u32,
    reduced_ticks: u32,
    /// Interface of the current Connected streak and its length
    streak: Option<(String, u32)>,
}

impl Debouncer {
    pub fn new(verified_ticks: u32, reduced_ticks: u32) -> Self {
        Self {
            verified_ticks: verified_ticks.max(1),
            reduced_ticks: reduced_ticks.max(1),
            streak: None,
        }
    }

    /// Feed one raw classification, get the effective state back
    pub fn observe(&mut self, raw: &ConnectionState) -> ConnectionState {
        let ConnectionState::Connected { interface, trust } = raw else {
            self.streak = None;
            return raw.clone();
        };

        let count = match &mut self.streak {
            Some((name, count)) if name == interface => {
                *count = count.saturating_add(1);
                *count
            }
            _ => {
                self.streak = Some((interface.clone(), 1));
                1
            }
        };

        let needed = match trust {
            Trust::Verified => self.verified_ticks,
            Trust::Reduced => self.reduced_ticks,
        };

        if count >= needed {
            raw.clone()
        } else {
            debug!("{} seen for {}/{} ticks", interface, count, needed);
            ConnectionState::Disconnected
        }
    }

    /// Length of the current Connected streak
    pub fn streak(&self) -> u32 {
        self.streak.as_ref().map(|(_, n)| *n).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tunlock_net::{Eligibility, InterfaceCandidate};

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            mtu: 1280,
            listen_port: 51820,
            name_prefix: "utun".to_string(),
        }
    }

    fn selection(
        source: SelectionSource,
        name: &str,
        mtu: u32,
        routable: bool,
    ) -> SelectionResult {
        SelectionResult {
            interface: Some(InterfaceCandidate {
                name: name.to_string(),
                mtu,
                has_routable_address: routable,
                associated_port: Some(51820),
                eligibility: Eligibility::Primary,
                addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2))],
            }),
            source,
            ambiguous: false,
        }
    }

    fn connected(name: &str, trust: Trust) -> ConnectionState {
        ConnectionState::Connected {
            interface: name.to_string(),
            trust,
        }
    }

    #[test]
    fn test_unresolved_is_disconnected() {
        assert_eq!(
            classify(&SelectionResult::unresolved(), &fingerprint()),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_no_routable_address_is_disconnected() {
        for source in [SelectionSource::Detected, SelectionSource::Fallback] {
            let sel = selection(source, "utun7", 1280, false);
            assert_eq!(classify(&sel, &fingerprint()), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn test_trust_follows_source() {
        let detected = selection(SelectionSource::Detected, "utun7", 1280, true);
        assert_eq!(classify(&detected, &fingerprint()), connected("utun7", Trust::Verified));

        let fallback = selection(SelectionSource::Fallback, "utun4", 1280, true);
        assert_eq!(classify(&fallback, &fingerprint()), connected("utun4", Trust::Reduced));
    }

    #[test]
    fn test_mtu_mismatch_is_degraded() {
        let sel = selection(SelectionSource::Fallback, "utun7", 1380, true);
        assert_eq!(
            classify(&sel, &fingerprint()),
            ConnectionState::Degraded {
                interface: "utun7".into(),
                mtu: 1380
            }
        );
    }

    #[test]
    fn test_one_connected_tick_is_not_enough() {
        let mut debouncer = Debouncer::new(2, 3);
        let raw = connected("utun7", Trust::Verified);

        assert_eq!(debouncer.observe(&raw), ConnectionState::Disconnected);
        assert_eq!(debouncer.observe(&raw), raw);
        assert_eq!(debouncer.observe(&raw), raw);
        assert_eq!(debouncer.streak(), 3);
    }

    #[test]
    fn test_reduced_trust_needs_more_ticks() {
        let mut debouncer = Debouncer::new(2, 3);
        let raw = connected("utun4", Trust::Reduced);

        assert!(!debouncer.observe(&raw).is_connected());
        assert!(!debouncer.observe(&raw).is_connected());
        assert!(debouncer.observe(&raw).is_connected());
    }

    #[test]
    fn test_disconnect_is_immediate_and_resets() {
        let mut debouncer = Debouncer::new(2, 3);
        let raw = connected("utun7", Trust::Verified);
        debouncer.observe(&raw);
        debouncer.observe(&raw);

        assert_eq!(
            debouncer.observe(&ConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
        assert_eq!(debouncer.streak(), 0);
        assert_eq!(debouncer.observe(&raw), ConnectionState::Disconnected);
    }

    #[test]
    fn test_interface_change_restarts_streak() {
        let mut debouncer = Debouncer::new(2, 3);
        debouncer.observe(&connected("utun7", Trust::Verified));
        assert!(!debouncer.observe(&connected("utun8", Trust::Verified)).is_connected());
        assert!(debouncer.observe(&connected("utun8", Trust::Verified)).is_connected());
    }

    #[test]
    fn test_degraded_passes_through() {
        let mut debouncer = Debouncer::new(2, 3);
        let degraded = ConnectionState::Degraded {
            interface: "utun7".into(),
            mtu: 1380,
        };
        assert_eq!(debouncer.observe(&degraded), degraded);
    }
}
