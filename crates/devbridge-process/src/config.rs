//! Launch descriptors and supervisor tuning

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Result};

/// Immutable description of how to launch (or re-find) a process
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Human-readable name, also used for the log file
    pub name: String,
    /// Executable followed by any fixed leading arguments
    pub command: Vec<String>,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Environment variables (added to parent env)
    pub env: HashMap<String, String>,
    /// Name or argv token used to find the process without a handle
    pub search_token: Option<String>,
    /// Adopt an already running process matching `search_token` instead of spawning (default on)
    pub search_for_existing: bool,
}

impl ProcessSpec {
    /// Create new process spec
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: vec![],
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            search_token: None,
            search_for_existing: true,
        }
    }

    /// Set the full command vector
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the executable path.
    ///
    /// A path with spaces is split into a command vector, so
    /// `"node /opt/bridge/main.js"` works as well as a bare binary name.
    pub fn executable(mut self, path: impl AsRef<str>) -> Self {
        self.command = path
            .as_ref()
            .split(' ')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the search token
    pub fn search_token(mut self, token: impl Into<String>) -> Self {
        self.search_token = Some(token.into());
        self
    }

    /// Enable/disable adopting an existing process on start
    pub fn search_for_existing(mut self, enabled: bool) -> Self {
        self.search_for_existing = enabled;
        self
    }

    /// Log file name derived from the display name
    pub fn log_file_name(&self) -> String {
        let sanitized: String = self
            .name
            .chars()
            .map(|c| match c {
                ' ' | '/' | '\\' => '_',
                other => other,
            })
            .collect();
        format!("{sanitized}.log")
    }

    /// Full command line: command vector, own args, then `extra`
    pub(crate) fn command_line(&self, extra: &[String]) -> Result<Vec<String>> {
        if self.command.is_empty() {
            return Err(ProcessError::InvalidSpec(format!(
                "process '{}' has no command",
                self.name
            )));
        }
        let mut line = self.command.clone();
        line.extend(self.args.iter().cloned());
        line.extend(extra.iter().cloned());
        Ok(line)
    }

    /// Working directory, falling back to the current directory
    pub(crate) fn resolved_working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}

/// Timing and capacity knobs shared by supervisors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory holding per-process log files
    pub output_dir: PathBuf,
    /// Readiness poll interval
    pub poll_interval_ms: u64,
    /// Delay the relay waits after both streams close
    pub settle_delay_ms: u64,
    /// Per-step wait for a killed process to disappear
    pub kill_timeout_ms: u64,
    /// Maximum number of buffered output lines
    pub queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("out"),
            poll_interval_ms: 500,
            settle_delay_ms: 500,
            kill_timeout_ms: 5_000,
            queue_capacity: 10_000,
        }
    }
}

impl SupervisorConfig {
    /// Set the log output directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the readiness poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the per-step kill timeout
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn kill_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Log file for a spec, rooted at `output_dir`
    pub fn log_path_for(&self, spec: &ProcessSpec) -> PathBuf {
        log_path(&self.output_dir, spec)
    }
}

fn log_path(dir: &Path, spec: &ProcessSpec) -> PathBuf {
    dir.join(spec.log_file_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_splits_on_spaces() {
        let spec = ProcessSpec::new("bridge").executable("node  /opt/bridge/main.js");
        assert_eq!(spec.command, vec!["node", "/opt/bridge/main.js"]);
    }

    #[test]
    fn test_command_line_appends_extra_args() {
        let spec = ProcessSpec::new("bridge")
            .command(["appium"])
            .args(["--port", "4723"]);
        let line = spec.command_line(&["--log".into(), "out/a.log".into()]).unwrap();
        assert_eq!(line, vec!["appium", "--port", "4723", "--log", "out/a.log"]);
    }

    #[test]
    fn test_empty_command_is_invalid() {
        let spec = ProcessSpec::new("nothing");
        assert!(matches!(
            spec.command_line(&[]),
            Err(ProcessError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_log_path_replaces_spaces() {
        let spec = ProcessSpec::new("Appium Server 2");
        let config = SupervisorConfig::default().output_dir("/tmp/out");
        assert_eq!(
            config.log_path_for(&spec),
            PathBuf::from("/tmp/out/Appium_Server_2.log")
        );
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 100}"#).unwrap();
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(100));
        assert_eq!(config.kill_timeout_duration(), Duration::from_secs(5));
        assert_eq!(config.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_kill_timeout_keeps_sub_second_precision() {
        let config = SupervisorConfig::default().kill_timeout(Duration::from_millis(300));
        assert_eq!(config.kill_timeout_ms, 300);
        assert_eq!(config.kill_timeout_duration(), Duration::from_millis(300));
    }
}
