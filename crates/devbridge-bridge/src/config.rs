//! Bridge configuration loading

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use devbridge_process::{ReadinessPolicy, SupervisorConfig};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable prefix, e.g. `DEVBRIDGE_LOG_PATH`
pub const ENV_PREFIX: &str = "DEVBRIDGE";

/// Settings for the automation bridge server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Display name, also used for the relay log file
    pub name: String,
    /// Executable, optionally with leading arguments separated by spaces
    pub executable: String,
    /// Token identifying an already running bridge
    pub search_token: String,
    /// Bridge's own log file, passed as `--log`
    pub log_path: Option<PathBuf>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// When the bridge counts as started
    pub readiness: ReadinessPolicy,
    /// Supervisor timing
    pub supervisor: SupervisorConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "appium".to_string(),
            executable: "appium".to_string(),
            search_token: "appium".to_string(),
            log_path: None,
            working_dir: None,
            // The bridge prints two lines once it listens
            readiness: ReadinessPolicy::new().minimum_lines(2).timeout_secs(10.0),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from an optional TOML file, then `DEVBRIDGE_*` environment overrides.
    ///
    /// Nested keys use a double underscore: `DEVBRIDGE_READINESS__TIMEOUT_SECONDS=30`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Arguments derived from configuration
    pub fn arguments(&self) -> Vec<String> {
        match &self.log_path {
            Some(path) => vec!["--log".to_string(), path.display().to_string()],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_readiness_policy() {
        let config = BridgeConfig::default();
        assert_eq!(config.readiness.minimum_lines, Some(2));
        assert_eq!(config.readiness.minimum_wait_seconds, None);
        assert_eq!(config.readiness.timeout_seconds, 10.0);
        assert!(config.arguments().is_empty());
    }

    #[test]
    fn test_log_path_becomes_argument() {
        let config = BridgeConfig {
            log_path: Some(PathBuf::from("out/appium.log")),
            ..Default::default()
        };
        assert_eq!(config.arguments(), vec!["--log", "out/appium.log"]);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            r#"
executable = "node /opt/appium/main.js"
log_path = "out/bridge.log"

[readiness]
minimum_lines = 3
timeout_seconds = 15.0

[supervisor]
kill_timeout_ms = 2000
"#,
        )
        .unwrap();

        let config = BridgeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.executable, "node /opt/appium/main.js");
        assert_eq!(config.search_token, "appium");
        assert_eq!(config.readiness.minimum_lines, Some(3));
        assert_eq!(config.readiness.timeout_seconds, 15.0);
        assert_eq!(config.supervisor.kill_timeout_ms, 2000);
        assert_eq!(config.supervisor.poll_interval_ms, 500);
    }

    #[test]
    #[serial]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BridgeConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("DEVBRIDGE_SEARCH_TOKEN", "bridge-server");
        let config = BridgeConfig::load(None);
        std::env::remove_var("DEVBRIDGE_SEARCH_TOKEN");

        let config = config.unwrap();
        assert_eq!(config.search_token, "bridge-server");
        assert_eq!(config.executable, "appium");
    }
}
