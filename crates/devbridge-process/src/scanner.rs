//! Process table scanning
//!
//! Every query works on a fresh [`ProcessTable`] snapshot taken through
//! `sysinfo`. Snapshots are racy by nature: processes we may not inspect
//! show up with an empty command line, and processes that exit while the
//! table is read are simply missing or reported as zombies.
//!
//! Threads are not processes here: sysinfo lists Linux tasks alongside
//! their owner, and a snapshot drops them. Searches never return the
//! supervising process itself.

use std::collections::{HashMap, HashSet};

use sysinfo::{Pid, ProcessStatus, System};

use crate::error::{ProcessError, Result};

/// A process found in the table. Not an owning handle: anyone may kill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmd: Vec<String>,
    /// Exited but not yet reaped by its parent
    pub zombie: bool,
}

impl ProcessHandle {
    /// Token matches the name exactly, as a substring, or as a whole argv element
    pub fn matches(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.name == token || self.name.contains(token) || self.cmd.iter().any(|arg| arg == token)
    }
}

/// A pid and its children, built from one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTreeNode {
    pub pid: u32,
    pub children: Vec<ProcessTreeNode>,
}

impl ProcessTreeNode {
    /// All descendants in pre-order, excluding this node
    pub fn descendants(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for child in &self.children {
            out.push(child.pid);
            out.extend(child.descendants());
        }
        out
    }

    /// Number of processes in the tree, root included
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ProcessTreeNode::count).sum::<usize>()
    }
}

/// Point-in-time copy of the OS process table
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<ProcessHandle>,
    /// Skipped by `find_one` and `find_all`
    excluded: Option<u32>,
}

impl ProcessTable {
    /// Read the current process table, without threads
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes();

        let threads = thread_ids(&system);
        let mut entries: Vec<ProcessHandle> = system
            .processes()
            .values()
            .filter(|process| !threads.contains(&process.pid()))
            .map(|process| ProcessHandle {
                pid: process.pid().as_u32(),
                parent: process.parent().map(|p| p.as_u32()),
                name: process.name().to_string(),
                cmd: process.cmd().to_vec(),
                zombie: is_exited(process.status()),
            })
            .collect();
        entries.sort_by_key(|entry| entry.pid);

        Self {
            entries,
            excluded: Some(std::process::id()),
        }
    }

    /// Build a table from known entries
    pub fn from_entries(entries: Vec<ProcessHandle>) -> Self {
        Self {
            entries,
            excluded: None,
        }
    }

    /// Hide `pid` from searches
    pub fn excluding(mut self, pid: u32) -> Self {
        self.excluded = Some(pid);
        self
    }

    pub fn entries(&self) -> &[ProcessHandle] {
        &self.entries
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessHandle> {
        self.entries.iter().find(|entry| entry.pid == pid)
    }

    /// First live process matching `token`, in table order
    pub fn find_one(&self, token: &str) -> Option<&ProcessHandle> {
        self.candidates(token).next()
    }

    /// Every live process matching `token`
    pub fn find_all(&self, token: &str) -> Vec<&ProcessHandle> {
        self.candidates(token).collect()
    }

    fn candidates<'a, 'b>(
        &'a self,
        token: &'b str,
    ) -> impl Iterator<Item = &'a ProcessHandle> + use<'a, 'b> {
        self.entries.iter().filter(move |entry| {
            !entry.zombie && Some(entry.pid) != self.excluded && entry.matches(token)
        })
    }

    /// Children of `pid` and their children, recursively
    pub fn tree(&self, pid: u32) -> ProcessTreeNode {
        let mut by_parent: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in &self.entries {
            if let Some(parent) = entry.parent {
                if parent != entry.pid {
                    by_parent.entry(parent).or_default().push(entry.pid);
                }
            }
        }

        let mut visited = HashSet::from([pid]);
        build_node(pid, &by_parent, &mut visited)
    }
}

fn build_node(
    pid: u32,
    by_parent: &HashMap<u32, Vec<u32>>,
    visited: &mut HashSet<u32>,
) -> ProcessTreeNode {
    let mut children = Vec::new();
    for &kid in by_parent.get(&pid).into_iter().flatten() {
        // pid reuse can make the parent links cyclic
        if visited.insert(kid) {
            children.push(build_node(kid, by_parent, visited));
        }
    }
    ProcessTreeNode { pid, children }
}

/// Task ids other than each process's main thread
fn thread_ids(system: &System) -> HashSet<Pid> {
    let mut threads = HashSet::new();
    for process in system.processes().values() {
        if let Some(tasks) = process.tasks() {
            threads.extend(tasks.iter().copied().filter(|task| *task != process.pid()));
        }
    }
    threads
}

fn is_exited(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Scans the live process table
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessScanner;

impl ProcessScanner {
    pub fn new() -> Self {
        Self
    }

    /// First process matching `token`. Which one wins among several is unspecified.
    pub fn find_one(&self, token: &str) -> Option<ProcessHandle> {
        ProcessTable::snapshot().find_one(token).cloned()
    }

    /// Every process matching `token`
    pub fn find_all(&self, token: &str) -> Vec<ProcessHandle> {
        ProcessTable::snapshot()
            .find_all(token)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Look up a pid, failing if it is not in the table
    pub fn require(&self, pid: u32) -> Result<ProcessHandle> {
        ProcessTable::snapshot()
            .get(pid)
            .cloned()
            .ok_or(ProcessError::NotFound { pid })
    }

    /// Whether `pid` exists and has not exited. Zombies count as dead.
    pub fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .map(|process| !is_exited(process.status()))
            .unwrap_or(false)
    }

    /// Whether `pid` is the supervising process or one of its threads
    pub fn is_self(&self, pid: u32) -> bool {
        let own = std::process::id();
        if pid == own {
            return true;
        }

        let mut system = System::new();
        system.refresh_processes();
        system
            .process(Pid::from_u32(own))
            .and_then(|process| process.tasks())
            .is_some_and(|tasks| tasks.contains(&Pid::from_u32(pid)))
    }

    /// Descendant tree of `pid` from a fresh snapshot
    pub fn process_tree(&self, pid: u32) -> ProcessTreeNode {
        ProcessTable::snapshot().tree(pid)
    }
}
