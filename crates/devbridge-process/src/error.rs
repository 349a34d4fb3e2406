//! Error types for process supervision

use std::io;
use thiserror::Error;

/// Process supervision errors
///
/// Only launching can fail in ordinary use. Readiness and termination
/// report their outcome as data (`bool`, [`KillReport`](crate::KillReport))
/// instead of raising.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failed to spawn process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Invalid launch descriptor
    #[error("Invalid process spec: {0}")]
    InvalidSpec(String),

    /// A supervisor is single-use
    #[error("Process '{name}' was already started")]
    AlreadyStarted { name: String },

    /// The OS could not answer whether a handle is still alive
    #[error("Failed to query liveness of process {pid}: {reason}")]
    Liveness { pid: u32, reason: String },

    /// Process not found
    #[error("Process not found (PID: {pid})")]
    NotFound { pid: u32 },
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
