//! Governor Configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then `TUNLOCK_*`
//! environment overrides, then validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunlock_firewall::{Allowances, BackendKind, validate_interface_name};
use tunlock_net::Fingerprint;

/// Config file read when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunlock/tunlock.toml";

/// Where the staged ruleset, prior state, status and pidfile live
pub const DEFAULT_STORAGE_PATH: &str = "/var/run/tunlock";

/// Tunnel fingerprint section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FingerprintConfig {
    pub mtu: u32,
    pub listen_port: u16,
    pub name_prefix: String,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        let fp = Fingerprint::default();
        Self {
            mtu: fp.mtu,
            listen_port: fp.listen_port,
            name_prefix: fp.name_prefix,
        }
    }
}

/// Extra traffic allowed while locked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub allow_dhcp: bool,
    pub allow_icmp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Public address lookup for "opened" notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublicAddressConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for PublicAddressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://ipinfo.io/ip".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// Public address leak check
///
/// Before the first lock, with no tunnel up, the public address is recorded
/// as the unprotected one. Seeing it again while unlocked means traffic is
/// leaving outside the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeakCheckConfig {
    pub enabled: bool,
}

impl Default for LeakCheckConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Complete governor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernorConfig {
    pub fingerprint: FingerprintConfig,
    /// Interface used unverified when nothing matches the fingerprint
    pub configured_interface_name: String,
    pub poll_interval_secs: u64,
    /// Deadline for one probe cycle
    pub query_timeout_ms: u64,
    /// Deadline for one firewall tool invocation
    pub gate_command_timeout_ms: u64,
    pub ruleset_storage_path: PathBuf,
    /// Ticks a Verified connection must hold before unlocking
    pub connect_debounce_ticks: u32,
    /// Ticks a Reduced-trust (fallback) connection must hold
    pub fallback_debounce_ticks: u32,
    pub gate_retry_attempts: u32,
    pub gate_retry_backoff_ms: u64,
    /// Restore the host firewall before exiting on a fatal error
    pub cleanup_on_fatal: bool,
    pub backend: BackendKind,
    pub policy: PolicyConfig,
    pub notifications: NotificationConfig,
    pub public_address: PublicAddressConfig,
    pub leak_check: LeakCheckConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            fingerprint: FingerprintConfig::default(),
            configured_interface_name: "utun4".to_string(),
            poll_interval_secs: 5,
            query_timeout_ms: 2000,
            gate_command_timeout_ms: 10_000,
            ruleset_storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            connect_debounce_ticks: 2,
            fallback_debounce_ticks: 3,
            gate_retry_attempts: 3,
            gate_retry_backoff_ms: 500,
            cleanup_on_fatal: false,
            backend: BackendKind::Auto,
            policy: PolicyConfig::default(),
            notifications: NotificationConfig::default(),
            public_address: PublicAddressConfig::default(),
            leak_check: LeakCheckConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Load from `path` (or the default path), apply the process
    /// environment, and validate.
    ///
    /// An explicitly given file must exist; a missing default file just
    /// means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `TUNLOCK_*` overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TUNLOCK_MTU") {
            self.fingerprint.mtu = parse_env("TUNLOCK_MTU", &v)?;
        }
        if let Some(v) = lookup("TUNLOCK_LISTEN_PORT") {
            self.fingerprint.listen_port = parse_env("TUNLOCK_LISTEN_PORT", &v)?;
        }
        if let Some(v) = lookup("TUNLOCK_NAME_PREFIX") {
            self.fingerprint.name_prefix = v;
        }
        if let Some(v) = lookup("TUNLOCK_INTERFACE") {
            self.configured_interface_name = v;
        }
        if let Some(v) = lookup("TUNLOCK_POLL_INTERVAL") {
            self.poll_interval_secs = parse_env("TUNLOCK_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("TUNLOCK_STORAGE") {
            self.ruleset_storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TUNLOCK_BACKEND") {
            self.backend = v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "TUNLOCK_BACKEND",
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fingerprint.mtu == 0 {
            return Err(ConfigError::ZeroMtu);
        }
        if self.fingerprint.listen_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.fingerprint.name_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("query_timeout_ms"));
        }
        if self.gate_command_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("gate_command_timeout_ms"));
        }
        if self.connect_debounce_ticks == 0 || self.fallback_debounce_ticks == 0 {
            return Err(ConfigError::ZeroDebounce);
        }
        if self.gate_retry_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        if validate_interface_name(&self.configured_interface_name).is_err() {
            return Err(ConfigError::InvalidInterfaceName(
                self.configured_interface_name.clone(),
            ));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            mtu: self.fingerprint.mtu,
            listen_port: self.fingerprint.listen_port,
            name_prefix: self.fingerprint.name_prefix.clone(),
        }
    }

    pub fn allowances(&self) -> Allowances {
        Allowances {
            handshake_port: self.fingerprint.listen_port,
            allow_dhcp: self.policy.allow_dhcp,
            allow_icmp: self.policy.allow_icmp,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn gate_command_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_command_timeout_ms)
    }

    pub fn gate_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.gate_retry_backoff_ms)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Invalid config file: {0}")]
    Parse(String),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Fingerprint MTU must be non-zero")]
    ZeroMtu,

    #[error("Fingerprint listen port must be non-zero")]
    ZeroPort,

    #[error("Fingerprint name prefix must not be empty")]
    EmptyPrefix,

    #[error("Poll interval must be at least one second")]
    ZeroPollInterval,

    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("Debounce tick counts must be at least 1")]
    ZeroDebounce,

    #[error("Gate retry attempts must be at least 1")]
    ZeroRetryAttempts,

    #[error("Invalid configured interface name {0:?}")]
    InvalidInterfaceName(String),
}
