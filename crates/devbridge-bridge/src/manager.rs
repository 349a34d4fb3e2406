//! Automation bridge manager
//!
//! Wraps a generic [`Supervisor`] with the bridge's launch arguments and
//! readiness policy, and turns a readiness timeout into a typed error.

use std::path::Path;
use std::sync::Arc;

use devbridge_process::{
    LaunchProfile, Ownership, ProcessRegistry, ProcessSpec, ProcessState, ReadinessPolicy,
    Supervisor,
};
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Launch profile for the bridge server
#[derive(Debug, Clone)]
pub struct BridgeProfile {
    config: BridgeConfig,
}

impl BridgeProfile {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl LaunchProfile for BridgeProfile {
    fn arguments(&self) -> Vec<String> {
        self.config.arguments()
    }

    fn readiness_policy(&self) -> ReadinessPolicy {
        self.config.readiness.clone()
    }
}

/// Starts, watches and stops the automation bridge server
#[derive(Debug)]
pub struct BridgeManager {
    supervisor: Supervisor,
}

impl BridgeManager {
    /// Bridge log used by the CLI when none is configured
    pub const DEFAULT_LOG_FILE: &'static str = "out/appium_manager.log";

    pub fn new(config: BridgeConfig, registry: Arc<ProcessRegistry>) -> Self {
        let mut spec = ProcessSpec::new(config.name.clone())
            .executable(&config.executable)
            .search_token(config.search_token.clone());
        if let Some(dir) = &config.working_dir {
            spec = spec.working_dir(dir);
        }

        let supervisor_config = config.supervisor.clone();
        let profile = Arc::new(BridgeProfile::new(config));
        Self {
            supervisor: Supervisor::new(spec, profile, supervisor_config, registry),
        }
    }

    pub fn name(&self) -> &str {
        self.supervisor.name()
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    pub fn log_file(&self) -> &Path {
        self.supervisor.log_file()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Start the bridge, or attach to one that is already running
    pub async fn start(&self) -> Result<Ownership> {
        debug!(name = %self.name(), "Starting bridge process");
        let ownership = self.supervisor.start().await?;
        debug!(name = %self.name(), ?ownership, "Bridge process started");
        Ok(ownership)
    }

    /// Wait for the bridge to initialize.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ExternalProcess`] if it never reported ready.
    pub async fn wait_until_ready(&self) -> Result<()> {
        debug!(name = %self.name(), "Waiting for bridge to initialize");
        let started = self.supervisor.wait_until_ready().await;
        debug!(name = %self.name(), started, "Bridge readiness reported");

        if started {
            Ok(())
        } else {
            Err(BridgeError::ExternalProcess {
                process_name: self.name().to_string(),
                reason: "waited for the process but it never reported ready".to_string(),
            })
        }
    }

    /// Start and wait for readiness in one step
    pub async fn launch(&self) -> Result<Ownership> {
        let ownership = self.start().await?;
        self.wait_until_ready().await?;
        Ok(ownership)
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.supervisor.is_running().await?)
    }

    /// Stop the bridge and everything it spawned
    pub async fn stop(&self) -> bool {
        self.supervisor.kill().await
    }
}
