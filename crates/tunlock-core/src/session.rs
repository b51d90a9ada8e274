//! Governor Session
//!
//! The loop's only mutable state, mirrored to `status.json` so that
//! `tunlock status` can read it from another process.

use crate::classifier::ConnectionState;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tunlock_firewall::GateState;

const STATUS_FILE: &str = "status.json";

/// Status file errors
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status file I/O: {0}")]
    Io(#[from] io::Error),

    #[error("status file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of a running governor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorSession {
    pub pid: u32,
    pub backend: String,
    /// Unix seconds
    pub started_at: u64,
    /// Unix seconds of the last tick
    pub updated_at: u64,
    pub ticks: u64,
    /// Effective (debounced) state of the last tick
    pub connection: ConnectionState,
    /// Last successfully applied gate state; `None` before the first apply
    pub gate: Option<GateState>,
    /// Interface the gate was most recently unlocked for
    pub last_applied_interface: Option<String>,
}

impl GovernorSession {
    pub fn new(backend: &str) -> Self {
        let now = unix_now();
        Self {
            pid: std::process::id(),
            backend: backend.to_string(),
            started_at: now,
            updated_at: now,
            ticks: 0,
            connection: ConnectionState::Disconnected,
            gate: None,
            last_applied_interface: None,
        }
    }

    /// Record the outcome of one tick. Returns whether the connection or
    /// gate state changed.
    pub fn record(&mut self, connection: ConnectionState, gate: Option<GateState>) -> bool {
        let changed = self.connection != connection || self.gate != gate;

        if let Some(GateState::Unlocked(iface)) = &gate {
            self.last_applied_interface = Some(iface.clone());
        }
        self.connection = connection;
        self.gate = gate;
        self.updated_at = unix_now();
        changed
    }

    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn status_path(storage: &Path) -> PathBuf {
        storage.join(STATUS_FILE)
    }

    pub fn write_status(&self, storage: &Path) -> Result<(), StatusError> {
        let path = Self::status_path(storage);
        let tmp = storage.join(format!("{}.tmp", STATUS_FILE));

        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_status(storage: &Path) -> Result<Option<Self>, StatusError> {
        match fs::read_to_string(Self::status_path(storage)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_status(storage: &Path) -> Result<(), StatusError> {
        match fs::remove_file(Self::status_path(storage)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
