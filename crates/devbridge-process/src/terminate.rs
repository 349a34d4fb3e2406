//! Termination engine: best-effort kill of processes and their descendants
//!
//! Nothing in here returns an error. Each step produces a [`KillOutcome`]
//! and failures are logged as warnings; callers read the aggregate from
//! [`KillReport::all_terminated`].

use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::scanner::ProcessScanner;

/// Exit confirmation poll interval
const CONFIRM_INTERVAL_MS: u64 = 50;

/// How hard to ask a process to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// SIGTERM: lets the process shut down in order
    Graceful,
    /// SIGKILL: cannot be ignored
    Forceful,
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::Graceful => f.write_str("terminate"),
            Escalation::Forceful => f.write_str("kill"),
        }
    }
}

/// Result of stopping a single process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillOutcome {
    pub pid: u32,
    /// The process was observed gone (or a zombie) afterwards
    pub confirmed_dead: bool,
    /// What went wrong, if anything
    pub error: Option<String>,
}

impl KillOutcome {
    /// The process is known to be gone
    pub fn dead(pid: u32) -> Self {
        Self {
            pid,
            confirmed_dead: true,
            error: None,
        }
    }
}

/// Outcomes for a process tree, descendants first and root last
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    pub root: u32,
    pub outcomes: Vec<KillOutcome>,
}

impl KillReport {
    pub fn new(root: u32) -> Self {
        Self {
            root,
            outcomes: Vec::new(),
        }
    }

    /// True iff every process in the report is confirmed not running
    pub fn all_terminated(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.confirmed_dead)
    }

    /// Processes still running after their kill attempt
    pub fn survivors(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.confirmed_dead)
            .map(|outcome| outcome.pid)
            .collect()
    }

    pub fn push(&mut self, outcome: KillOutcome) {
        self.outcomes.push(outcome);
    }

    /// Append another report's outcomes
    pub fn merge(&mut self, other: KillReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// Kills processes and process trees with bounded waits
#[derive(Debug, Clone)]
pub struct TerminationEngine {
    scanner: ProcessScanner,
    timeout: Duration,
    confirm_interval: Duration,
}

impl TerminationEngine {
    /// Create an engine that waits up to `timeout` for each process to exit
    pub fn new(timeout: Duration) -> Self {
        Self {
            scanner: ProcessScanner::new(),
            timeout,
            confirm_interval: Duration::from_millis(CONFIRM_INTERVAL_MS),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.kill_timeout_duration())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forcefully kill one process and wait for it to go away
    pub async fn kill(&self, pid: u32) -> KillOutcome {
        self.signal_and_confirm(pid, Escalation::Forceful).await
    }

    /// Ask one process to exit and wait for it to go away
    pub async fn terminate(&self, pid: u32) -> KillOutcome {
        self.signal_and_confirm(pid, Escalation::Graceful).await
    }

    /// Terminate, falling back to kill if the process survives
    pub async fn stop(&self, pid: u32) -> KillOutcome {
        let outcome = self.terminate(pid).await;
        if outcome.confirmed_dead {
            return outcome;
        }
        debug!(pid, "Escalating to kill");
        self.kill(pid).await
    }

    /// Kill `pid` and every descendant, reporting each step
    pub async fn kill_tree_report(&self, pid: u32) -> KillReport {
        let tree = self.scanner.process_tree(pid);
        let descendants = tree.descendants();
        if !descendants.is_empty() {
            debug!(pid, count = descendants.len(), "Found children");
        }

        let mut report = KillReport::new(pid);
        for child in descendants {
            debug!(pid = child, parent = pid, "Killing child process");
            report.push(self.kill(child).await);
        }
        report.push(self.kill(pid).await);

        if report.all_terminated() {
            info!(pid, processes = report.outcomes.len(), "Process tree killed");
        } else {
            warn!(pid, survivors = ?report.survivors(), "Process tree not fully killed");
        }
        report
    }

    /// Kill `pid` and every descendant. True iff all are confirmed gone.
    pub async fn kill_tree(&self, pid: u32) -> bool {
        self.kill_tree_report(pid).await.all_terminated()
    }

    /// Wait up to the engine timeout for `pid` to exit
    pub async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if !self.scanner.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.confirm_interval).await;
        }
    }

    async fn signal_and_confirm(&self, pid: u32, escalation: Escalation) -> KillOutcome {
        if self.scanner.is_self(pid) {
            warn!(pid, action = %escalation, "Refusing to stop the supervising process");
            return KillOutcome {
                pid,
                confirmed_dead: false,
                error: Some("refusing to signal the supervising process".to_string()),
            };
        }
        if !self.scanner.is_alive(pid) {
            debug!(pid, "Process already gone");
            return KillOutcome::dead(pid);
        }

        if let Err(reason) = send_signal(pid, escalation) {
            warn!(pid, action = %escalation, error = %reason, "Failed to signal process");
            return KillOutcome {
                pid,
                confirmed_dead: !self.scanner.is_alive(pid),
                error: Some(reason),
            };
        }

        if self.wait_for_exit(pid).await {
            debug!(pid, action = %escalation, "Process exited");
            KillOutcome::dead(pid)
        } else {
            warn!(
                pid,
                action = %escalation,
                timeout_ms = self.timeout.as_millis() as u64,
                "Timeout waiting for process to exit"
            );
            KillOutcome {
                pid,
                confirmed_dead: false,
                error: Some(format!("still running after {:?}", self.timeout)),
            }
        }
    }
}

impl Default for TerminationEngine {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

/// Deliver a stop request. A process that is already gone counts as success.
fn send_signal(pid: u32, escalation: Escalation) -> Result<(), String> {
    if pid == 0 {
        return Err("refusing to signal pid 0".to_string());
    }
    if pid == std::process::id() {
        return Err("refusing to signal the supervising process".to_string());
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = match escalation {
            Escalation::Graceful => Signal::SIGTERM,
            Escalation::Forceful => Signal::SIGKILL,
        };

        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, Signal, System};

        let sys_pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(sys_pid) {
            return Ok(());
        }
        let Some(process) = system.process(sys_pid) else {
            return Ok(());
        };

        let sent = match escalation {
            Escalation::Graceful => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            Escalation::Forceful => process.kill(),
        };
        if sent {
            Ok(())
        } else {
            Err("kill request rejected".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(pid: u32, dead: bool) -> KillOutcome {
        KillOutcome {
            pid,
            confirmed_dead: dead,
            error: None,
        }
    }

    #[test]
    fn test_report_aggregates_with_and() {
        let mut report = KillReport::new(1);
        report.push(outcome(2, true));
        report.push(outcome(1, true));
        assert!(report.all_terminated());

        report.push(outcome(3, false));
        assert!(!report.all_terminated());
        assert_eq!(report.survivors(), vec![3]);
    }

    #[test]
    fn test_refuses_to_signal_self_or_zero() {
        assert!(send_signal(0, Escalation::Forceful).is_err());
        assert!(send_signal(std::process::id(), Escalation::Graceful).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reaped_pid_is_success() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let engine = TerminationEngine::new(Duration::from_secs(1));
        assert!(engine.kill(pid).await.confirmed_dead);
        assert!(engine.kill_tree(pid).await);
        assert!(engine.kill_tree(pid).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_running_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let engine = TerminationEngine::new(Duration::from_secs(5));
        let outcome = engine.stop(pid).await;
        assert!(outcome.confirmed_dead);
        assert!(outcome.error.is_none());
        child.wait().await.unwrap();
    }

    /// Spawn a shell that ignores SIGTERM, returning once the trap is installed
    #[cfg(unix)]
    async fn spawn_term_ignoring_shell() -> tokio::process::Child {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; echo armed; while :; do sleep 0.1; done"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "armed");
        child
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_escalates_when_terminate_is_ignored() {
        let mut child = spawn_term_ignoring_shell().await;
        let pid = child.id().unwrap();
        let engine = TerminationEngine::new(Duration::from_millis(300));

        let graceful = engine.terminate(pid).await;
        assert!(!graceful.confirmed_dead);
        assert!(graceful.error.is_some());

        let stopped = engine.stop(pid).await;
        assert!(stopped.confirmed_dead);
        assert!(stopped.error.is_none());
        child.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refuses_to_stop_self_through_engine() {
        let engine = TerminationEngine::new(Duration::from_millis(100));
        let outcome = engine.kill(std::process::id()).await;
        assert!(!outcome.confirmed_dead);
        assert!(outcome.error.is_some());
    }
}
