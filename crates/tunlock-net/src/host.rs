//! Host Network Access
//!
//! The [`HostNetwork`] trait is the only place the probe touches the OS.
//! [`SystemNetwork`] implements it with:
//!
//! - `getifaddrs(3)` for interface names and addresses
//! - `/sys/class/net/<if>/mtu` (Linux) or `ifconfig <if>` (macOS) for MTU
//! - `/proc/net/{udp,tcp}{,6}` (Linux) or `netstat -an` (macOS) for listeners

use crate::privilege::PrivilegeContext;
use crate::probe::ProbeError;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use tracing::debug;

/// One network interface as seen by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    /// Interface name (e.g. "utun4", "wg0")
    pub name: String,
    /// MTU, if it could be read
    pub mtu: Option<u32>,
    /// All assigned IPv4/IPv6 addresses
    pub addresses: Vec<IpAddr>,
}

/// Read-only view of the host network stack
pub trait HostNetwork: Send + Sync {
    /// Enumerate every interface. Failure here is fatal for the caller.
    fn interfaces(&self) -> Result<Vec<HostInterface>, ProbeError>;

    /// Is any UDP or TCP listener bound to `port`?
    fn is_listening(&self, port: u16) -> Result<bool, ProbeError>;
}

/// Check if an address can carry routed traffic
///
/// Loopback, unspecified, link-local and multicast addresses don't count.
pub fn is_routable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_unspecified() || v4.is_link_local() || v4.is_multicast())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || link_local)
        }
    }
}

/// The real host, queried through system calls and system tools
pub struct SystemNetwork {
    _privilege: PrivilegeContext,
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    command_timeout: Duration,
}

impl SystemNetwork {
    pub fn new(privilege: &PrivilegeContext, command_timeout: Duration) -> Self {
        Self {
            _privilege: privilege.clone(),
            command_timeout,
        }
    }

    #[cfg(target_os = "linux")]
    fn read_mtu(&self, name: &str) -> Option<u32> {
        std::fs::read_to_string(format!("/sys/class/net/{}/mtu", name))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn read_mtu(&self, name: &str) -> Option<u32> {
        let out = crate::command::run_command("ifconfig", &[name], self.command_timeout).ok()?;
        if !out.success() {
            return None;
        }
        parse_ifconfig_mtu(&out.stdout)
    }
}

impl HostNetwork for SystemNetwork {
    fn interfaces(&self) -> Result<Vec<HostInterface>, ProbeError> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| ProbeError::Enumeration(format!("getifaddrs failed: {}", e)))?;

        // BTreeMap keeps enumeration order stable across ticks
        let mut by_name: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
        for ifaddr in addrs {
            let entry = by_name.entry(ifaddr.interface_name.clone()).or_default();
            let Some(storage) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = storage.as_sockaddr_in() {
                entry.push(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                entry.push(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
            }
        }

        Ok(by_name
            .into_iter()
            .map(|(name, addresses)| HostInterface {
                mtu: self.read_mtu(&name),
                name,
                addresses,
            })
            .collect())
    }

    #[cfg(target_os = "linux")]
    fn is_listening(&self, port: u16) -> Result<bool, ProbeError> {
        let mut any_read = false;
        for (table, tcp) in [
            ("/proc/net/udp", false),
            ("/proc/net/udp6", false),
            ("/proc/net/tcp", true),
            ("/proc/net/tcp6", true),
        ] {
            // IPv6 tables are missing when IPv6 is disabled
            let Ok(contents) = std::fs::read_to_string(table) else {
                continue;
            };
            any_read = true;
            if proc_net_has_port(&contents, port, tcp) {
                debug!("Listener on port {} found in {}", port, table);
                return Ok(true);
            }
        }

        if any_read {
            Ok(false)
        } else {
            Err(ProbeError::ListenerLookup(
                "no /proc/net socket table readable".to_string(),
            ))
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn is_listening(&self, port: u16) -> Result<bool, ProbeError> {
        for proto in ["udp", "tcp"] {
            let out = crate::command::run_command(
                "netstat",
                &["-an", "-p", proto],
                self.command_timeout,
            )
            .map_err(|e| ProbeError::ListenerLookup(format!("netstat: {}", e)))?;

            if !out.success() {
                return Err(ProbeError::ListenerLookup(format!(
                    "netstat -p {} exited with {}",
                    proto, out.status
                )));
            }
            if netstat_has_port(&out.stdout, port) {
                debug!("Listener on {} port {} found", proto, port);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Extract the MTU from `ifconfig <if>` output ("... mtu 1280")
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn parse_ifconfig_mtu(output: &str) -> Option<u32> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "mtu" {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

/// Scan a `/proc/net/{udp,tcp}[6]` table for a socket bound to `port`.
///
/// TCP sockets only count in LISTEN state (0A); any bound UDP socket counts.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn proc_net_has_port(contents: &str, port: u16, tcp: bool) -> bool {
    contents.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return false;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            return false;
        };
        let Ok(local_port) = u16::from_str_radix(port_hex, 16) else {
            return false;
        };
        local_port == port && (!tcp || fields[3] == "0A")
    })
}

/// Scan `netstat -an` output for a local endpoint on `port`.
///
/// BSD netstat prints endpoints as `addr.port`; TCP rows must be LISTEN.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn netstat_has_port(output: &str, port: u16) -> bool {
    let wanted = port.to_string();
    output.lines().any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            return false;
        }
        let proto = fields[0];
        if !(proto.starts_with("udp") || proto.starts_with("tcp")) {
            return false;
        }
        let local_port = fields[3].rsplit('.').next().unwrap_or("");
        if local_port != wanted {
            return false;
        }
        !proto.starts_with("tcp") || fields.last() == Some(&"LISTEN")
    })
}
