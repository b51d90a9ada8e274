//! tunlock governor core
//!
//! The kill-switch state machine, independent of how the host is probed or
//! how rulesets are loaded:
//!
//! - [`InterfaceSelector`]: picks the authoritative tunnel interface
//! - [`classify`] / [`Debouncer`]: connection state with debounced Connected
//! - [`Governor`]: the poll loop driving the [`tunlock_firewall::FirewallGate`]
//! - [`GovernorConfig`]: TOML + environment configuration
//!
//! # Architecture
//!
//! ```text
//! Governor ──▶ CandidateSource (probe) ──▶ InterfaceSelector
//!    │                                          │
//!    │                         ConnectivityClassifier + Debouncer
//!    │                                          │
//!    ├──────────────▶ FirewallGate ◀────────────┘
//!    └──▶ Notifier / PublicAddressResolver
//! ```

mod classifier;
mod config;
mod governor;
mod notify;
mod selector;
mod session;

pub use classifier::{ConnectionState, Debouncer, Trust, classify};
pub use config::{
    ConfigError, DEFAULT_CONFIG_PATH, DEFAULT_STORAGE_PATH, FingerprintConfig, GovernorConfig,
    LeakCheckConfig, NotificationConfig, PolicyConfig, PublicAddressConfig,
};
pub use governor::{Governor, GovernorError};
pub use notify::{DesktopNotifier, KillSwitchEvent, LogNotifier, Notifier};
pub use selector::{InterfaceSelector, SelectionResult, SelectionSource};
pub use session::{GovernorSession, StatusError};
