//! # devbridge-bridge
//!
//! **Purpose**: Lifecycle of the device-automation bridge server
//!
//! Supplies the bridge-specific launch arguments and readiness policy to a
//! generic [`devbridge_process::Supervisor`], and reports a bridge that
//! never came up as [`BridgeError::ExternalProcess`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use devbridge_bridge::{BridgeConfig, BridgeManager};
//! use devbridge_process::ProcessRegistry;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ProcessRegistry::new());
//! let manager = BridgeManager::new(BridgeConfig::load(None)?, registry);
//!
//! manager.launch().await?;
//! // drive devices through the bridge
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use manager::{BridgeManager, BridgeProfile};
