//! Bridge error types

use devbridge_process::ProcessError;
use thiserror::Error;

/// Bridge manager errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The managed process did not initialize in time
    #[error("External process '{process_name}' failed: {reason}")]
    ExternalProcess {
        process_name: String,
        reason: String,
    },

    /// Underlying process supervision failed
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
