//! Interface Probe
//!
//! Turns the host's interface list into tunnel interface candidates.
//!
//! # Candidate Rules
//!
//! - Only interfaces whose name starts with the fingerprint prefix are
//!   considered, plus the interface literally named after the configured
//!   fallback name.
//! - Interfaces with the wrong MTU are dropped, unless the configured
//!   interface is absent: then they are kept as [`Eligibility::FallbackOnly`]
//!   and can never count as a fingerprint match. The configured interface is
//!   never dropped.
//! - `has_routable_address` needs both a listener on the fingerprint port and
//!   a routable address on the interface.
//!
//! The probe never chooses a winner; that is the selector's job.

use crate::bounded::run_bounded;
use crate::host::{HostInterface, HostNetwork, is_routable};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Probe errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("interface enumeration failed: {0}")]
    Enumeration(String),

    #[error("listener lookup failed: {0}")]
    ListenerLookup(String),
}

/// Observable attributes that identify the VPN's tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Expected tunnel MTU
    pub mtu: u32,
    /// Port the VPN daemon listens on (handshake port)
    pub listen_port: u16,
    /// Driver naming convention, e.g. "utun" or "wg"
    pub name_prefix: String,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self {
            mtu: 1280,
            listen_port: 51820,
            name_prefix: default_name_prefix().to_string(),
        }
    }
}

/// Tunnel device family for this platform
pub fn default_name_prefix() -> &'static str {
    if cfg!(target_os = "macos") { "utun" } else { "wg" }
}

/// How a candidate may be used by the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// MTU matched (or this is the configured interface)
    Primary,
    /// MTU mismatched; only selectable by name, never as a detected match
    FallbackOnly,
}

/// One possible tunnel interface, as observed on a single probe cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCandidate {
    pub name: String,
    /// 0 when the MTU could not be read
    pub mtu: u32,
    /// Listener on the fingerprint port AND a routable address
    pub has_routable_address: bool,
    /// The fingerprint port, when a listener is bound to it
    pub associated_port: Option<u16>,
    pub eligibility: Eligibility,
    /// Addresses seen on the interface (for logging)
    pub addresses: Vec<IpAddr>,
}

impl InterfaceCandidate {
    /// Check if the MTU matches the fingerprint
    pub fn mtu_matches(&self, fingerprint: &Fingerprint) -> bool {
        self.mtu == fingerprint.mtu
    }

    /// Check if this candidate fully satisfies the fingerprint
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.eligibility == Eligibility::Primary
            && self.mtu_matches(fingerprint)
            && self.has_routable_address
            && self.associated_port == Some(fingerprint.listen_port)
    }
}

/// Anything that can produce a candidate set for one tick
pub trait CandidateSource: Send {
    fn candidates(&self, fingerprint: &Fingerprint) -> Result<Vec<InterfaceCandidate>, ProbeError>;
}

/// Probe over a [`HostNetwork`]
pub struct InterfaceProbe<H> {
    host: Arc<H>,
    configured_name: String,
    query_timeout: Duration,
}

impl<H: HostNetwork + 'static> InterfaceProbe<H> {
    pub fn new(host: H, configured_name: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            host: Arc::new(host),
            configured_name: configured_name.into(),
            query_timeout,
        }
    }

    /// Probe the host without a deadline
    pub fn probe(&self, fingerprint: &Fingerprint) -> Result<Vec<InterfaceCandidate>, ProbeError> {
        probe_host(self.host.as_ref(), fingerprint, &self.configured_name)
    }
}

impl<H: HostNetwork + 'static> CandidateSource for InterfaceProbe<H> {
    /// Probe the host, bounded by the query timeout.
    ///
    /// A probe that overruns yields no candidates for this tick, which the
    /// classifier reads as Disconnected.
    fn candidates(&self, fingerprint: &Fingerprint) -> Result<Vec<InterfaceCandidate>, ProbeError> {
        let host = Arc::clone(&self.host);
        let fp = fingerprint.clone();
        let configured = self.configured_name.clone();

        match run_bounded("probe", self.query_timeout, move || {
            probe_host(host.as_ref(), &fp, &configured)
        }) {
            Some(result) => result,
            None => {
                warn!("Interface probe timed out, treating as no candidates");
                Ok(Vec::new())
            }
        }
    }
}

fn probe_host<H: HostNetwork + ?Sized>(
    host: &H,
    fingerprint: &Fingerprint,
    configured_name: &str,
) -> Result<Vec<InterfaceCandidate>, ProbeError> {
    let interfaces = host.interfaces()?;

    let listening = match host.is_listening(fingerprint.listen_port) {
        Ok(listening) => listening,
        Err(e) => {
            warn!("{}; assuming no listener", e);
            false
        }
    };

    Ok(build_candidates(&interfaces, listening, fingerprint, configured_name))
}

/// Apply the candidate rules to an interface list
pub fn build_candidates(
    interfaces: &[HostInterface],
    listening: bool,
    fingerprint: &Fingerprint,
    configured_name: &str,
) -> Vec<InterfaceCandidate> {
    let configured_present = interfaces.iter().any(|i| i.name == configured_name);

    interfaces
        .iter()
        .filter(|i| i.name.starts_with(&fingerprint.name_prefix) || i.name == configured_name)
        .filter_map(|iface| {
            let mtu = iface.mtu.unwrap_or(0);
            let eligibility = if mtu == fingerprint.mtu || iface.name == configured_name {
                Eligibility::Primary
            } else if !configured_present {
                Eligibility::FallbackOnly
            } else {
                debug!(
                    "Discarding {} (mtu {} != {})",
                    iface.name, mtu, fingerprint.mtu
                );
                return None;
            };

            let has_address = iface.addresses.iter().any(is_routable);
            Some(InterfaceCandidate {
                name: iface.name.clone(),
                mtu,
                has_routable_address: listening && has_address,
                associated_port: listening.then_some(fingerprint.listen_port),
                eligibility,
                addresses: iface.addresses.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn iface(name: &str, mtu: u32, addr: Option<[u8; 4]>) -> HostInterface {
        HostInterface {
            name: name.to_string(),
            mtu: Some(mtu),
            addresses: addr
                .map(|a| vec![IpAddr::V4(Ipv4Addr::from(a))])
                .unwrap_or_default(),
        }
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            mtu: 1280,
            listen_port: 51820,
            name_prefix: "utun".to_string(),
        }
    }

    struct FakeHost {
        interfaces: Result<Vec<HostInterface>, ProbeError>,
        listening: Result<bool, ProbeError>,
        delay: Duration,
    }

    impl HostNetwork for FakeHost {
        fn interfaces(&self) -> Result<Vec<HostInterface>, ProbeError> {
            std::thread::sleep(self.delay);
            self.interfaces.clone()
        }

        fn is_listening(&self, _port: u16) -> Result<bool, ProbeError> {
            self.listening.clone()
        }
    }

    #[test]
    fn test_full_match_candidate() {
        let ifaces = vec![iface("utun7", 1280, Some([10, 8, 0, 2]))];
        let candidates = build_candidates(&ifaces, true, &fingerprint(), "utun4");

        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].matches(&fingerprint()));
        assert_eq!(candidates[0].associated_port, Some(51820));
    }

    #[test]
    fn test_prefix_filter() {
        let ifaces = vec![
            iface("en0", 1280, Some([192, 168, 1, 20])),
            iface("lo0", 1280, Some([127, 0, 0, 1])),
            iface("utun7", 1280, Some([10, 8, 0, 2])),
        ];
        let candidates = build_candidates(&ifaces, true, &fingerprint(), "utun4");
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["utun7"]);
    }

    #[test]
    fn test_address_requires_listener() {
        let ifaces = vec![iface("utun7", 1280, Some([10, 8, 0, 2]))];
        let candidates = build_candidates(&ifaces, false, &fingerprint(), "utun4");

        assert!(!candidates[0].has_routable_address);
        assert_eq!(candidates[0].associated_port, None);
        assert!(!candidates[0].matches(&fingerprint()));
    }

    #[test]
    fn test_link_local_only_is_not_routable() {
        let mut utun0 = iface("utun0", 1280, None);
        utun0.addresses.push("fe80::1".parse().unwrap());
        let candidates = build_candidates(&[utun0], true, &fingerprint(), "utun4");
        assert!(!candidates[0].has_routable_address);
    }

    #[test]
    fn test_mtu_mismatch_dropped_when_configured_present() {
        let ifaces = vec![
            iface("utun0", 1380, Some([10, 1, 0, 2])),
            iface("utun4", 1280, Some([10, 8, 0, 2])),
        ];
        let candidates = build_candidates(&ifaces, true, &fingerprint(), "utun4");
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["utun4"]);
    }

    #[test]
    fn test_mtu_mismatch_kept_as_fallback_only() {
        let ifaces = vec![iface("utun7", 1380, Some([10, 8, 0, 2]))];
        let candidates = build_candidates(&ifaces, true, &fingerprint(), "utun4");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].eligibility, Eligibility::FallbackOnly);
        assert!(!candidates[0].matches(&fingerprint()));
    }

    #[test]
    fn test_configured_interface_never_dropped() {
        let ifaces = vec![iface("utun4", 1500, Some([10, 8, 0, 2]))];
        let candidates = build_candidates(&ifaces, true, &fingerprint(), "utun4");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].eligibility, Eligibility::Primary);
        assert!(!candidates[0].mtu_matches(&fingerprint()));
    }

    #[test]
    fn test_configured_name_outside_prefix() {
        let ifaces = vec![iface("tun0", 1280, Some([10, 8, 0, 2]))];
        let candidates = build_candidates(&ifaces, true, &fingerprint(), "tun0");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "tun0");
    }

    #[test]
    fn test_enumeration_failure_is_fatal() {
        let host = FakeHost {
            interfaces: Err(ProbeError::Enumeration("EPERM".into())),
            listening: Ok(true),
            delay: Duration::ZERO,
        };
        let probe = InterfaceProbe::new(host, "utun4", Duration::from_secs(1));
        let result = probe.candidates(&fingerprint());
        assert!(matches!(result, Err(ProbeError::Enumeration(_))));
    }

    #[test]
    fn test_listener_failure_means_no_listener() {
        let host = FakeHost {
            interfaces: Ok(vec![iface("utun7", 1280, Some([10, 8, 0, 2]))]),
            listening: Err(ProbeError::ListenerLookup("netstat missing".into())),
            delay: Duration::ZERO,
        };
        let probe = InterfaceProbe::new(host, "utun4", Duration::from_secs(1));
        let candidates = probe.candidates(&fingerprint()).unwrap();
        assert!(!candidates[0].has_routable_address);
    }

    #[test]
    fn test_timeout_yields_no_candidates() {
        let host = FakeHost {
            interfaces: Ok(vec![iface("utun7", 1280, Some([10, 8, 0, 2]))]),
            listening: Ok(true),
            delay: Duration::from_millis(300),
        };
        let probe = InterfaceProbe::new(host, "utun4", Duration::from_millis(20));
        assert!(probe.candidates(&fingerprint()).unwrap().is_empty());

        // The unbounded path still sees the interface
        assert_eq!(probe.probe(&fingerprint()).unwrap().len(), 1);
    }
}
