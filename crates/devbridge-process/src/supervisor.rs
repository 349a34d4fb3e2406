//! Process supervisor - lifecycle orchestration
//!
//! A [`Supervisor`] launches (or adopts) one external process, relays its
//! output, reports readiness and tears the whole process tree down again.
//! It is single-use: once started it is never started a second time.
//! All operations take `&self`, so a supervisor shared behind an `Arc`
//! can be killed while another task is still waiting for readiness.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ProcessSpec, SupervisorConfig},
    error::{ProcessError, Result},
    readiness::{self, ReadinessPolicy},
    registry::ProcessRegistry,
    relay::{OutputLine, OutputQueue, OutputRelay},
    scanner::ProcessScanner,
    terminate::{KillOutcome, KillReport, TerminationEngine},
};

/// Supplies the launch details a generic supervisor cannot know
pub trait LaunchProfile: Send + Sync {
    /// Extra arguments appended after the `ProcessSpec` command line
    fn arguments(&self) -> Vec<String> {
        Vec::new()
    }

    /// Policy used by [`Supervisor::wait_until_ready`]
    fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy::default()
    }
}

/// Profile with no extra arguments and the default readiness policy
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainProfile;

impl LaunchProfile for PlainProfile {}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    /// Running, readiness not yet known
    Spawned,
    Ready,
    /// Did not report ready in time; still running and killable
    NotReady,
    Terminating,
    Terminated,
}

/// Whether the supervisor launched the process itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Spawned here; a direct child handle and output relay exist
    Owned,
    /// Found by a process table scan; no handle, no relay
    Adopted,
}

/// Runtime state of a launched or adopted process
#[derive(Debug)]
struct SupervisedProcess {
    pid: u32,
    child: Option<Child>,
    relay: Option<OutputRelay>,
    ownership: Ownership,
    exit_status: Option<ExitStatus>,
}

impl SupervisedProcess {
    fn adopted(pid: u32) -> Self {
        Self {
            pid,
            child: None,
            relay: None,
            ownership: Ownership::Adopted,
            exit_status: None,
        }
    }

    /// What a kill should do with this process, if anything
    fn kill_target(&mut self, scanner: &ProcessScanner) -> Option<KillTarget> {
        match self.ownership {
            Ownership::Owned => match self.poll_exit() {
                Ok(Some(_)) => Some(KillTarget::Exited(self.pid)),
                Ok(None) | Err(_) => Some(KillTarget::Running(self.pid)),
            },
            Ownership::Adopted if scanner.is_alive(self.pid) => Some(KillTarget::Running(self.pid)),
            Ownership::Adopted => None,
        }
    }

    /// Non-blocking exit check on the owned handle
    fn poll_exit(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait() {
            Ok(status) => {
                self.exit_status = status;
                Ok(status)
            }
            Err(e) => Err(ProcessError::Liveness {
                pid: self.pid,
                reason: e.to_string(),
            }),
        }
    }
}

/// Primary process of a kill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillTarget {
    /// Owned child already reaped; its pid may belong to someone else now
    Exited(u32),
    Running(u32),
}

impl KillTarget {
    fn pid(self) -> u32 {
        match self {
            KillTarget::Exited(pid) | KillTarget::Running(pid) => pid,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: ProcessState,
    pid: Option<u32>,
    ownership: Option<Ownership>,
}

/// Supervises one external process
pub struct Supervisor {
    spec: ProcessSpec,
    profile: Arc<dyn LaunchProfile>,
    config: SupervisorConfig,
    registry: Arc<ProcessRegistry>,
    scanner: ProcessScanner,
    engine: TerminationEngine,
    log_file: PathBuf,
    queue: OutputQueue,
    status: parking_lot::Mutex<Status>,
    process: tokio::sync::Mutex<Option<SupervisedProcess>>,
}

impl Supervisor {
    /// Create a supervisor for `spec`
    pub fn new(
        spec: ProcessSpec,
        profile: Arc<dyn LaunchProfile>,
        config: SupervisorConfig,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        let log_file = config.log_path_for(&spec);
        let queue = OutputQueue::new(config.queue_capacity);
        let engine = TerminationEngine::from_config(&config);

        Self {
            spec,
            profile,
            config,
            registry,
            scanner: ProcessScanner::new(),
            engine,
            log_file,
            queue,
            status: parking_lot::Mutex::new(Status {
                state: ProcessState::Idle,
                pid: None,
                ownership: None,
            }),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a supervisor with [`PlainProfile`]
    pub fn plain(spec: ProcessSpec, config: SupervisorConfig, registry: Arc<ProcessRegistry>) -> Self {
        Self::new(spec, Arc::new(PlainProfile), config, registry)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Per-instance log file the relay appends to
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn state(&self) -> ProcessState {
        self.status.lock().state
    }

    /// Process ID, once spawned or adopted
    pub fn pid(&self) -> Option<u32> {
        self.status.lock().pid
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.status.lock().ownership
    }

    /// Handle to the captured output queue
    pub fn output(&self) -> OutputQueue {
        self.queue.clone()
    }

    /// Launch the process, or adopt a running one found by search token.
    ///
    /// # Examples
    /// ```no_run
    /// use std::sync::Arc;
    /// use devbridge_process::{ProcessRegistry, ProcessSpec, Supervisor, SupervisorConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let registry = Arc::new(ProcessRegistry::new());
    /// let spec = ProcessSpec::new("bridge").command(["appium"]).search_token("appium");
    /// let supervisor = Supervisor::plain(spec, SupervisorConfig::default(), registry);
    /// supervisor.start().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(&self) -> Result<Ownership> {
        let mut slot = self.process.lock().await;
        if slot.is_some() || self.state() != ProcessState::Idle {
            return Err(ProcessError::AlreadyStarted {
                name: self.spec.name.clone(),
            });
        }

        if let Some(found) = self.find_existing() {
            info!(name = %self.spec.name, pid = found, "Adopting running process");
            self.registry
                .register(found, self.spec.name.clone(), Ownership::Adopted);
            *slot = Some(SupervisedProcess::adopted(found));
            self.mark_started(found, Ownership::Adopted);
            return Ok(Ownership::Adopted);
        }

        let extra = self.profile.arguments();
        let command_line = self.spec.command_line(&extra)?;
        let working_dir = self.spec.resolved_working_dir()?;

        debug!(
            name = %self.spec.name,
            command = ?command_line,
            working_dir = %working_dir.display(),
            "Spawning process"
        );

        let mut cmd = Command::new(&command_line[0]);
        cmd.args(&command_line[1..])
            .current_dir(&working_dir)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!(name = %self.spec.name, error = %e, "Failed to spawn process");
            ProcessError::SpawnFailed(e)
        })?;
        let pid = child.id().ok_or_else(|| {
            ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Failed to get process ID",
            ))
        })?;

        info!(name = %self.spec.name, pid, "Started process");

        let relay = OutputRelay::spawn(
            self.spec.name.clone(),
            child.stdout.take(),
            child.stderr.take(),
            self.queue.clone(),
            Some(self.log_file.clone()),
            self.config.settle_delay(),
        );

        self.registry
            .register(pid, self.spec.name.clone(), Ownership::Owned);
        *slot = Some(SupervisedProcess {
            pid,
            child: Some(child),
            relay: Some(relay),
            ownership: Ownership::Owned,
            exit_status: None,
        });
        self.mark_started(pid, Ownership::Owned);
        Ok(Ownership::Owned)
    }

    /// Wait until the profile's readiness policy is satisfied
    pub async fn wait_until_ready(&self) -> bool {
        let policy = self.profile.readiness_policy();
        self.wait_for_ready(&policy).await
    }

    /// Poll captured output until `policy` is satisfied or times out.
    ///
    /// An adopted process has no output to watch and is ready if it is
    /// still alive. Returns `false` when nothing was started.
    pub async fn wait_for_ready(&self, policy: &ReadinessPolicy) -> bool {
        let Status { state, pid, ownership } = *self.status.lock();
        let (Some(pid), Some(ownership)) = (pid, ownership) else {
            debug!(name = %self.spec.name, "Nothing started; not waiting");
            return false;
        };
        if matches!(state, ProcessState::Terminating | ProcessState::Terminated) {
            return false;
        }

        debug!(name = %self.spec.name, pid, "Waiting for process to initialize");
        let ready = match ownership {
            Ownership::Adopted => self.scanner.is_alive(pid),
            Ownership::Owned => {
                readiness::wait_for_ready(&self.queue, policy, self.config.poll_interval_duration())
                    .await
            }
        };

        self.record_readiness(ready);
        debug!(name = %self.spec.name, ready, "Readiness wait finished");
        ready
    }

    /// Take every line captured so far without waiting
    pub fn read_output(&self) -> Vec<OutputLine> {
        let lines = self.queue.drain();
        if lines.is_empty() {
            debug!(name = %self.spec.name, "No output in process queue");
        }
        for line in &lines {
            debug!(name = %self.spec.name, stream = %line.stream, "{}", line.text);
        }
        lines
    }

    /// Exit code of an owned process that has exited
    pub async fn return_code(&self) -> Option<i32> {
        let mut slot = self.process.lock().await;
        let process = slot.as_mut()?;
        match process.poll_exit() {
            Ok(status) => status.and_then(|s| s.code()),
            Err(e) => {
                warn!(name = %self.spec.name, error = %e, "Failed to poll exit status");
                None
            }
        }
    }

    /// Wait up to `timeout` for an owned process to exit on its own
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        let mut slot = self.process.lock().await;
        let process = slot.as_mut()?;
        if let Some(status) = process.exit_status {
            return status.code();
        }
        let child = process.child.as_mut()?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                process.exit_status = Some(status);
                status.code()
            }
            Ok(Err(e)) => {
                warn!(name = %self.spec.name, error = %e, "Error waiting for process");
                None
            }
            Err(_) => {
                warn!(
                    name = %self.spec.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timeout waiting for process to exit"
                );
                None
            }
        }
    }

    /// Whether the process is alive.
    ///
    /// True if the owned handle reports running, or a table scan for the
    /// search token finds a match. Errors only when the OS cannot answer
    /// for the owned handle.
    pub async fn is_running(&self) -> Result<bool> {
        let mut slot = self.process.lock().await;
        if let Some(process) = slot.as_mut() {
            match process.ownership {
                Ownership::Owned if process.child.is_some() => {
                    if process.poll_exit()?.is_none() {
                        return Ok(true);
                    }
                }
                Ownership::Adopted if self.scanner.is_alive(process.pid) => return Ok(true),
                _ => {}
            }
        }
        drop(slot);

        let running = self.search().is_some();
        debug!(name = %self.spec.name, running, "Checked whether process is running");
        Ok(running)
    }

    /// Stop the process tree and any stray same-token processes.
    ///
    /// Never fails; returns `true` iff everything found was confirmed dead.
    pub async fn kill(&self) -> bool {
        self.kill_report().await.all_terminated()
    }

    /// [`kill`](Self::kill), with the per-process outcomes
    pub async fn kill_report(&self) -> KillReport {
        let mut slot = self.process.lock().await;
        let had_process = slot.is_some();
        if had_process {
            self.set_state(ProcessState::Terminating);
        }

        let target = slot
            .as_mut()
            .and_then(|process| process.kill_target(&self.scanner))
            .or_else(|| self.search().map(KillTarget::Running));
        let primary = target.map(KillTarget::pid);

        let mut report = KillReport::new(primary.unwrap_or_default());
        match target {
            Some(KillTarget::Exited(pid)) => {
                debug!(name = %self.spec.name, pid, "Process already exited; not signalling");
                report.push(KillOutcome::dead(pid));
            }
            Some(KillTarget::Running(pid)) => {
                debug!(name = %self.spec.name, pid, "Killing process tree");
                report.merge(self.engine.kill_tree_report(pid).await);
            }
            None => {}
        }

        if let Some(token) = &self.spec.search_token {
            let strays = self.scanner.find_all(token);
            debug!(name = %self.spec.name, count = strays.len(), "Found processes matching search token");
            for stray in strays {
                let handled = report
                    .outcomes
                    .iter()
                    .any(|outcome| outcome.pid == stray.pid && outcome.confirmed_dead);
                if handled {
                    continue;
                }
                debug!(name = %self.spec.name, pid = stray.pid, "Stopping stray process");
                report.push(self.engine.stop(stray.pid).await);
            }
        }

        if let Some(process) = slot.as_mut() {
            self.reap(process).await;
            self.registry.deregister(process.pid);
        }
        if let Some(pid) = primary {
            self.registry.deregister(pid);
        }

        let stopped = report.all_terminated();
        if had_process {
            self.set_state(ProcessState::Terminated);
        }
        if stopped {
            info!(name = %self.spec.name, processes = report.outcomes.len(), "Process stopped");
        } else {
            warn!(name = %self.spec.name, survivors = ?report.survivors(), "Process not fully stopped");
        }
        report
    }

    async fn reap(&self, process: &mut SupervisedProcess) {
        if let Some(mut child) = process.child.take() {
            match tokio::time::timeout(self.engine.timeout(), child.wait()).await {
                Ok(Ok(status)) => process.exit_status = Some(status),
                Ok(Err(e)) => {
                    warn!(name = %self.spec.name, error = %e, "Error reaping process");
                }
                Err(_) => warn!(name = %self.spec.name, "Timeout reaping process"),
            }
        }

        if let Some(relay) = process.relay.take() {
            let grace = self.config.settle_delay() + self.engine.timeout();
            if !relay.join(grace).await {
                warn!(name = %self.spec.name, "Output relay did not finish; aborted");
            }
        }
    }

    fn find_existing(&self) -> Option<u32> {
        if !self.spec.search_for_existing {
            return None;
        }
        self.search()
    }

    fn search(&self) -> Option<u32> {
        let token = self.spec.search_token.as_deref()?;
        debug!(name = %self.spec.name, token, "Searching for process");
        self.scanner.find_one(token).map(|found| found.pid)
    }

    fn mark_started(&self, pid: u32, ownership: Ownership) {
        {
            let mut status = self.status.lock();
            status.pid = Some(pid);
            status.ownership = Some(ownership);
        }
        self.set_state(ProcessState::Spawned);
    }

    fn record_readiness(&self, ready: bool) {
        let current = self.state();
        let next = match (current, ready) {
            (ProcessState::Spawned | ProcessState::NotReady | ProcessState::Ready, true) => {
                ProcessState::Ready
            }
            (ProcessState::Spawned | ProcessState::NotReady, false) => ProcessState::NotReady,
            // Ready never regresses, and termination wins
            (other, _) => other,
        };
        if next != current {
            self.set_state(next);
        }
    }

    fn set_state(&self, next: ProcessState) {
        let previous = {
            let mut status = self.status.lock();
            std::mem::replace(&mut status.state, next)
        };
        debug!(name = %self.spec.name, from = ?previous, to = ?next, "Process state changed");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("log_file", &self.log_file)
            .finish()
    }
}
