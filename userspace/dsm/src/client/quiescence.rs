// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Write-Quiescence Monitor
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (deterministic pacer) + tests/scenarios.rs
//!
//! One monitor runs per write grant on its own thread. It polls the page
//! until it stops changing (or the poll bound is reached), re-applies the
//! write block and publishes the page with a CommitPage frame.
//!
//! The commit is fire-and-forget: no acknowledgement is awaited and a frame
//! lost in transit leaves the coordinator's record locked. Delivery rests on
//! the stream transport alone.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::client::context::ClientContext;
use crate::client::outbox::Outbox;
use crate::client::permissions::PermissionStore;
use crate::config::QuiescencePolicy;
use crate::page::{AddressSpaceId, PageIdentity};
use crate::wire::{Message, Opcode};

/// Pause source between polls.
pub trait Pacer: Send + Sync {
    /// Waits before the next poll.
    fn pause(&self, policy: &QuiescencePolicy);
}

/// Yields or sleeps the monitor thread according to the policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, policy: &QuiescencePolicy) {
        let interval = policy.poll_interval();
        if interval.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(interval);
        }
    }
}

/// How a monitor finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiescenceOutcome {
    /// The page stayed unchanged for the configured number of polls.
    Quiet {
        /// Polls performed.
        polls: u32,
    },
    /// The poll bound was reached, or the page vanished mid-watch; committed anyway.
    Bounded {
        /// Polls performed.
        polls: u32,
    },
    /// The page could not be read at all; nothing was committed.
    Unmapped,
}

/// Watches one granted page.
pub struct QuiescenceMonitor {
    page: PageIdentity,
    space: AddressSpaceId,
    vaddr: u64,
    pid: u32,
    policy: QuiescencePolicy,
    permissions: PermissionStore,
    outbox: Outbox,
    pacer: Arc<dyn Pacer>,
}

impl QuiescenceMonitor {
    /// Monitor for the page named by the AllowWrite frame `grant`.
    pub fn new(ctx: &ClientContext, grant: &Message) -> Self {
        Self {
            page: grant.page(),
            space: grant.space,
            vaddr: grant.vaddr,
            pid: grant.client_pid,
            policy: ctx.config.quiescence,
            permissions: ctx.permissions.clone(),
            outbox: ctx.outbox.clone(),
            pacer: ctx.pacer.clone(),
        }
    }

    /// Polls until quiet, then re-blocks writes and commits.
    pub fn run(self) -> QuiescenceOutcome {
        let Ok(mut previous) = self.permissions.capture(self.page) else {
            error!("dsm-client: granted page {} is not mapped; nothing to commit", self.page);
            return QuiescenceOutcome::Unmapped;
        };
        let mut idle = 0;
        let mut polls = 0;
        let outcome = loop {
            if polls >= self.policy.max_iterations {
                break QuiescenceOutcome::Bounded { polls };
            }
            self.pacer.pause(&self.policy);
            polls += 1;
            match self.permissions.capture(self.page) {
                Ok(current) if current == previous => {
                    idle += 1;
                    if idle >= self.policy.idle_polls {
                        break QuiescenceOutcome::Quiet { polls };
                    }
                }
                Ok(current) => {
                    idle = 0;
                    previous = current;
                }
                Err(err) => {
                    warn!("dsm-client: lost page {} while watching writes: {err}", self.page);
                    break QuiescenceOutcome::Bounded { polls };
                }
            }
        };

        if let Err(err) = self.permissions.block_writes(self.page) {
            warn!("dsm-client: re-blocking writes on {} failed: {err}", self.page);
        }
        let content = self.permissions.capture(self.page).unwrap_or(previous);
        let commit = Message::request(Opcode::CommitPage, self.space, self.vaddr, self.pid)
            .with_payload(content);
        match self.outbox.send(&commit) {
            Ok(()) => debug!("dsm-client: committed {} after {outcome:?}", self.page),
            Err(err) => error!("dsm-client: commit of {} lost: {err}", self.page),
        }
        outcome
    }
}

/// Threads of the write monitors spawned by a session.
#[derive(Clone, Default)]
pub struct MonitorSet {
    handles: Arc<Mutex<Vec<JoinHandle<QuiescenceOutcome>>>>,
}

impl MonitorSet {
    /// Starts `monitor` on its own thread.
    pub fn spawn(&self, monitor: QuiescenceMonitor) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name("dsm-quiescence".into())
            .spawn(move || monitor.run())?;
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Waits for every tracked monitor and returns their outcomes.
    pub fn join_all(&self) -> Vec<QuiescenceOutcome> {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    }

    /// Monitors currently tracked (running or finished but not yet pruned).
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns `true` when no monitor is tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::context::ClientEnv;
    use crate::client::pagetable::{PageTable, PermissionFlags};
    use crate::client::sim::SimPageTable;
    use crate::client::targets::StaticResolver;
    use crate::config::ClientConfig;
    use crate::transport::{connection_pair, Wait};
    use crate::wire::Code;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SPACE: AddressSpaceId = AddressSpaceId(3);
    const VADDR: u64 = 0x6000;

    /// Writes a new byte during each of the first `busy` pauses.
    struct ScriptedWriter {
        sim: Arc<SimPageTable>,
        busy: u32,
        pauses: AtomicU32,
    }

    impl Pacer for ScriptedWriter {
        fn pause(&self, _policy: &QuiescencePolicy) {
            let n = self.pauses.fetch_add(1, Ordering::SeqCst);
            if n < self.busy {
                self.sim.store(SPACE, 1, VADDR + u64::from(n), 0xee).unwrap();
            }
        }
    }

    fn setup(busy: u32, policy: QuiescencePolicy) -> (QuiescenceMonitor, Arc<SimPageTable>, crate::Connection) {
        let sim = Arc::new(SimPageTable::new());
        let page = PageIdentity::containing(SPACE, VADDR);
        sim.map(page, true);
        let pacer = Arc::new(ScriptedWriter { sim: sim.clone(), busy, pauses: AtomicU32::new(0) });
        let (near, far) = connection_pair();
        let (sink, _source) = near.into_split();
        let config = ClientConfig { quiescence: policy, ..ClientConfig::default() };
        let env = ClientEnv::new(sim.clone(), sim.clone(), Arc::new(StaticResolver::new())).with_pacer(pacer);
        let ctx = ClientContext::new(config, env, Outbox::new(sink));
        let grant = Message::request(Opcode::AllowWrite, SPACE, VADDR, 1);
        (QuiescenceMonitor::new(&ctx, &grant), sim, far)
    }

    #[test]
    fn commits_after_first_unchanged_poll() {
        let (monitor, sim, mut far) = setup(2, QuiescencePolicy::default());
        let outcome = monitor.run();
        // Polls 1 and 2 observe changes, poll 3 is the idle one.
        assert_eq!(outcome, QuiescenceOutcome::Quiet { polls: 3 });
        let page = PageIdentity::containing(SPACE, VADDR);
        assert!(!sim.flags(page).unwrap().contains(PermissionFlags::WRITE));

        let commit = far.recv(Wait::NonBlocking).unwrap();
        assert_eq!(commit.code, Code::Op(Opcode::CommitPage));
        let payload = commit.payload.unwrap();
        assert_eq!(&payload.as_bytes()[..3], &[0xee, 0xee, 0]);
    }

    #[test]
    fn gives_up_waiting_at_the_bound() {
        let policy = QuiescencePolicy { max_iterations: 4, idle_polls: 1, poll_interval_us: 0 };
        let (monitor, _sim, mut far) = setup(10, policy);
        assert_eq!(monitor.run(), QuiescenceOutcome::Bounded { polls: 4 });
        let commit = far.recv(Wait::NonBlocking).unwrap();
        assert_eq!(&commit.payload.unwrap().as_bytes()[..5], &[0xee, 0xee, 0xee, 0xee, 0]);
    }

    #[test]
    fn unmapped_grant_commits_nothing() {
        let (monitor, sim, mut far) = setup(0, QuiescencePolicy::default());
        sim.unmap(PageIdentity::containing(SPACE, VADDR));
        assert_eq!(monitor.run(), QuiescenceOutcome::Unmapped);
        assert!(far.recv(Wait::NonBlocking).is_err());
    }

    #[test]
    fn monitor_set_joins_spawned_threads() {
        let (monitor, _sim, _far) = setup(0, QuiescencePolicy::default());
        let set = MonitorSet::default();
        set.spawn(monitor).unwrap();
        assert_eq!(set.join_all(), vec![QuiescenceOutcome::Quiet { polls: 1 }]);
        assert!(set.is_empty());
    }
}
