//! tunlock host networking
//!
//! Everything the governor needs to know about the host's network stack,
//! read-only:
//!
//! - [`PrivilegeContext`]: capability token proving the process may enumerate
//!   interfaces and load firewall rulesets
//! - [`InterfaceProbe`]: finds tunnel interface candidates matching a
//!   [`Fingerprint`] (MTU, listener port, name prefix)
//! - [`run_bounded`] / [`run_command`]: every host query has a deadline
//! - [`HttpAddressResolver`]: public-facing address lookup for notifications
//!
//! # Probe Pipeline
//!
//! ```text
//! getifaddrs ──▶ prefix filter ──▶ MTU read ──▶ listener check ──▶ candidates
//!                                     │
//!                                     └─ mismatch: dropped, or FallbackOnly
//! ```

mod bounded;
mod command;
mod host;
mod privilege;
mod probe;
mod public_address;

pub use bounded::run_bounded;
pub use command::{CommandOutput, run_command};
pub use host::{HostInterface, HostNetwork, SystemNetwork, is_routable};
pub use privilege::{PrivilegeContext, PrivilegeError, PrivilegeLevel};
pub use probe::{
    CandidateSource, Eligibility, Fingerprint, InterfaceCandidate, InterfaceProbe, ProbeError,
    build_candidates, default_name_prefix,
};
pub use public_address::{HttpAddressResolver, LookupError, PublicAddressResolver};
