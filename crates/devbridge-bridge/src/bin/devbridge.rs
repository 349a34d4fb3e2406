use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use devbridge_bridge::{BridgeConfig, BridgeManager};
use devbridge_process::{KillReport, ProcessRegistry, ProcessScanner, TerminationEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devbridge")]
#[command(about = "Run and clean up the device-automation bridge server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge, wait until it is ready, stop it on Ctrl-C
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the bridge executable
        #[arg(short, long)]
        executable: Option<String>,

        /// Bridge log file passed as --log
        #[arg(short, long)]
        log: Option<PathBuf>,
    },
    /// List processes matching a name or argument token
    Find {
        /// Name, name fragment or exact argument
        token: String,
    },
    /// Kill a process and all of its descendants
    Kill {
        /// Process ID
        pid: u32,

        /// Seconds to wait for each process to exit
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            executable,
            log,
        } => run_bridge(config, executable, log).await,
        Commands::Find { token } => {
            let found = ProcessScanner::new().find_all(&token);
            if found.is_empty() {
                bail!("no process matches '{token}'");
            }
            for process in found {
                println!("{}\t{}\t{}", process.pid, process.name, process.cmd.join(" "));
            }
            Ok(())
        }
        Commands::Kill { pid, timeout } => {
            let report = kill_command(pid, Duration::from_secs(timeout)).await;
            for outcome in &report.outcomes {
                let status = if outcome.confirmed_dead { "stopped" } else { "RUNNING" };
                match &outcome.error {
                    Some(error) => println!("{}\t{}\t{}", outcome.pid, status, error),
                    None => println!("{}\t{}", outcome.pid, status),
                }
            }
            if !report.all_terminated() {
                bail!("processes still running: {:?}", report.survivors());
            }
            Ok(())
        }
    }
}

/// Kill a process tree. A pid that is already gone is reported as stopped.
async fn kill_command(pid: u32, timeout: Duration) -> KillReport {
    match ProcessScanner::new().require(pid) {
        Ok(handle) => tracing::info!(pid, name = %handle.name, "Killing process tree"),
        Err(e) => tracing::info!(pid, error = %e, "Process already gone"),
    }
    TerminationEngine::new(timeout).kill_tree_report(pid).await
}

async fn run_bridge(
    config_path: Option<PathBuf>,
    executable: Option<String>,
    log: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config =
        BridgeConfig::load(config_path.as_deref()).context("Failed to load bridge config")?;
    if let Some(executable) = executable {
        config.executable = executable;
    }
    if log.is_some() {
        config.log_path = log;
    }
    if config.log_path.is_none() {
        config.log_path = Some(PathBuf::from(BridgeManager::DEFAULT_LOG_FILE));
    }

    let engine = TerminationEngine::from_config(&config.supervisor);
    let registry = Arc::new(ProcessRegistry::new());
    let manager = BridgeManager::new(config, registry.clone());

    let ownership = manager.start().await?;
    if let Err(e) = manager.wait_until_ready().await {
        manager.stop().await;
        return Err(e.into());
    }
    tracing::info!(
        name = %manager.name(),
        pid = ?manager.pid(),
        ?ownership,
        log = %manager.log_file().display(),
        "Bridge is ready; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let stopped = manager.stop().await;
    let registry_clean = registry
        .shutdown_all(&engine)
        .await
        .iter()
        .all(|report| report.all_terminated());

    if !(stopped && registry_clean) {
        bail!("bridge processes did not all stop");
    }
    tracing::info!("Bridge stopped");
    Ok(())
}
