//! Pre-session firewall state
//!
//! Captured once when a session starts and persisted next to the staged
//! ruleset, so that both graceful shutdown and `tunlock cleanup` after a
//! crash know what to put back.

use crate::GateError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const PRIOR_STATE_FILE: &str = "prior_state.json";

/// Host firewall state before tunlock touched it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorState {
    /// Backend that captured this state
    pub backend: String,
    /// Was the host firewall enabled (pf) before the session?
    pub firewall_enabled: bool,
    /// Ruleset file to reload on restore (pf: /etc/pf.conf)
    pub restore_ruleset: Option<PathBuf>,
    /// Unix seconds
    pub captured_at: u64,
}

impl PriorState {
    pub fn new(backend: &str, firewall_enabled: bool, restore_ruleset: Option<PathBuf>) -> Self {
        let captured_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            backend: backend.to_string(),
            firewall_enabled,
            restore_ruleset,
            captured_at,
        }
    }

    pub fn path(storage: &Path) -> PathBuf {
        storage.join(PRIOR_STATE_FILE)
    }

    /// Load a previously persisted state, if one exists
    pub fn load(storage: &Path) -> Result<Option<Self>, GateError> {
        match fs::read_to_string(Self::path(storage)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist via write-to-temp and rename
    pub fn save(&self, storage: &Path) -> Result<(), GateError> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&Self::path(storage), json.as_bytes())?;
        Ok(())
    }

    pub fn remove(storage: &Path) -> Result<(), GateError> {
        match fs::remove_file(Self::path(storage)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `contents` to `path` so readers only ever see the old or the new file
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}
