use std::io;
use thiserror::Error;

/// Firewall gate errors
#[derive(Debug, Error)]
pub enum GateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("invalid interface name {0:?}")]
    InvalidInterface(String),

    #[error("firewall backend {0} is not supported on this platform")]
    Unsupported(String),

    #[error("firewall backend {0} requires root privilege")]
    Privilege(&'static str),

    #[error("prior state file is corrupt: {0}")]
    PriorState(#[from] serde_json::Error),
}

impl GateError {
    /// Errors that a later retry cannot fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GateError::InvalidInterface(_) | GateError::Unsupported(_) | GateError::Privilege(_)
        )
    }
}
