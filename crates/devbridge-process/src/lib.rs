//! # devbridge-process
//!
//! **Purpose**: Supervision of external helper processes for devbridge
//!
//! Launches an auxiliary server process, decides when it has finished
//! initializing, captures its output without blocking, and tears it down
//! again together with every process it spawned, even when the process
//! was found by scanning the process table rather than spawned here.
//!
//! ## Features
//!
//! - **Output Relay**: One background task per process drains stdout/stderr into a bounded queue
//! - **Readiness Detection**: Poll the queue against a line count, minimum wait and timeout
//! - **Process Table Scanning**: Find processes by name or command-line token
//! - **Tree Kill**: Kill descendants then the root, confirming each exit
//! - **Adoption**: Re-attach to an already running process instead of spawning a duplicate
//! - **Registry**: Explicit process-wide record of supervised processes for shutdown
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use devbridge_process::{ProcessRegistry, ProcessSpec, ReadinessPolicy, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ProcessRegistry::new());
//!
//! let spec = ProcessSpec::new("Appium Server")
//!     .executable("appium")
//!     .args(["--port", "4723"])
//!     .search_token("appium");
//!
//! let supervisor = Supervisor::plain(spec, SupervisorConfig::default(), registry);
//! supervisor.start().await?;
//!
//! let policy = ReadinessPolicy::new().minimum_lines(2).timeout_secs(10.0);
//! if supervisor.wait_for_ready(&policy).await {
//!     // talk to the server
//! }
//!
//! supervisor.kill().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod readiness;
pub mod registry;
pub mod relay;
pub mod scanner;
pub mod supervisor;
pub mod terminate;

pub use config::{ProcessSpec, SupervisorConfig};
pub use error::{ProcessError, Result};
pub use readiness::{wait_for_ready, Readiness, ReadinessPolicy, ReadinessTracker};
pub use registry::{ProcessRegistry, RegisteredProcess};
pub use relay::{OutputLine, OutputQueue, OutputRelay, StreamKind};
pub use scanner::{ProcessHandle, ProcessScanner, ProcessTable, ProcessTreeNode};
pub use supervisor::{LaunchProfile, Ownership, PlainProfile, ProcessState, Supervisor};
pub use terminate::{Escalation, KillOutcome, KillReport, TerminationEngine};
