//! Process-wide record of supervised processes
//!
//! The program that launches a run owns one registry, hands it to every
//! supervisor as `Arc<ProcessRegistry>`, and drains it on shutdown.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::scanner::ProcessScanner;
use crate::supervisor::Ownership;
use crate::terminate::{KillReport, TerminationEngine};

/// A registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredProcess {
    pub pid: u32,
    pub name: String,
    pub ownership: Ownership,
}

/// Tracks live supervised processes by pid
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: DashMap<u32, RegisteredProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, name: impl Into<String>, ownership: Ownership) {
        let name = name.into();
        debug!(pid, name = %name, ?ownership, "Registering process");
        self.entries.insert(
            pid,
            RegisteredProcess {
                pid,
                name,
                ownership,
            },
        );
    }

    pub fn deregister(&self, pid: u32) -> Option<RegisteredProcess> {
        self.entries.remove(&pid).map(|(_, entry)| entry)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of registered processes, ordered by pid
    pub fn list(&self) -> Vec<RegisteredProcess> {
        let mut list: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|entry| entry.pid);
        list
    }

    /// Entries whose process is still in the process table
    pub fn live(&self, scanner: &ProcessScanner) -> Vec<RegisteredProcess> {
        self.list()
            .into_iter()
            .filter(|entry| scanner.is_alive(entry.pid))
            .collect()
    }

    /// Kill every registered tree and clear the registry
    pub async fn shutdown_all(&self, engine: &TerminationEngine) -> Vec<KillReport> {
        let entries = self.list();
        self.entries.clear();

        if !entries.is_empty() {
            info!(count = entries.len(), "Stopping registered processes");
        }

        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            debug!(pid = entry.pid, name = %entry.name, "Stopping registered process");
            reports.push(engine.kill_tree_report(entry.pid).await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_deregister() {
        let registry = ProcessRegistry::new();
        registry.register(42, "bridge", Ownership::Owned);
        registry.register(7, "helper", Ownership::Adopted);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list()[0].pid, 7);
        assert_eq!(registry.deregister(42).map(|e| e.name), Some("bridge".to_string()));
        assert!(!registry.contains(42));
        assert!(registry.deregister(42).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_all_kills_and_clears() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let registry = ProcessRegistry::new();
        registry.register(pid, "sleeper", Ownership::Owned);
        assert_eq!(registry.live(&ProcessScanner::new()).len(), 1);

        let reports = registry
            .shutdown_all(&TerminationEngine::new(Duration::from_secs(5)))
            .await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].all_terminated());
        assert!(registry.is_empty());
        child.wait().await.unwrap();
    }
}
