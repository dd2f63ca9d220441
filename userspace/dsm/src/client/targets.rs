// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protocol target membership by process name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Maps a process id to a stable process name.
pub trait ProcessResolver: Send + Sync {
    /// Name of `pid`, or `None` if it cannot be determined.
    fn name_of(&self, pid: u32) -> Option<String>;
}

/// Resolves names from the basename of `/proc/<pid>/exe`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsResolver;

#[cfg(target_os = "linux")]
impl ProcessResolver for ProcfsResolver {
    fn name_of(&self, pid: u32) -> Option<String> {
        let exe = std::fs::read_link(format!("/proc/{pid}/exe")).ok()?;
        exe.file_name()?.to_str().map(str::to_owned)
    }
}

/// Fixed pid → name table.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    names: HashMap<u32, String>,
}

impl StaticResolver {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one entry.
    pub fn with(mut self, pid: u32, name: impl Into<String>) -> Self {
        self.names.insert(pid, name.into());
        self
    }
}

impl ProcessResolver for StaticResolver {
    fn name_of(&self, pid: u32) -> Option<String> {
        self.names.get(&pid).cloned()
    }
}

/// Set of process names taking part in the protocol.
///
/// Verdicts are cached per pid; pids are assumed not to be reused by another
/// program during a session.
pub struct TargetSet {
    names: Vec<String>,
    resolver: Arc<dyn ProcessResolver>,
    verdicts: Mutex<HashMap<u32, bool>>,
}

impl TargetSet {
    /// Targets `names`, resolving pids through `resolver`.
    pub fn new(names: Vec<String>, resolver: Arc<dyn ProcessResolver>) -> Self {
        Self { names, resolver, verdicts: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if `pid` runs one of the target programs.
    pub fn is_target(&self, pid: u32) -> bool {
        if let Some(&verdict) = self.verdicts.lock().get(&pid) {
            return verdict;
        }
        let Some(name) = self.resolver.name_of(pid) else {
            return false;
        };
        let verdict = self.names.iter().any(|target| *target == name);
        self.verdicts.lock().insert(pid, verdict);
        verdict
    }
}
