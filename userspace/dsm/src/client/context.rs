// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Session context handed to every client protocol entry point.

use std::sync::Arc;

use crate::client::ledger::PendingLockLedger;
use crate::client::outbox::Outbox;
use crate::client::pagetable::{FallbackResolver, PageTable};
use crate::client::permissions::PermissionStore;
use crate::client::quiescence::{MonitorSet, Pacer, ThreadPacer};
use crate::client::targets::{ProcessResolver, TargetSet};
use crate::client::throttle::WriteThrottle;
use crate::config::ClientConfig;

/// Host collaborators a session runs against.
pub struct ClientEnv {
    /// Page-table entries of the target address spaces.
    pub page_table: Arc<dyn PageTable>,
    /// Default host fault handling.
    pub fallback: Arc<dyn FallbackResolver>,
    /// Process id → name lookup for target membership.
    pub processes: Arc<dyn ProcessResolver>,
    /// Poll pacing of write monitors.
    pub pacer: Arc<dyn Pacer>,
}

impl ClientEnv {
    /// Environment with the thread-yielding pacer.
    pub fn new(
        page_table: Arc<dyn PageTable>,
        fallback: Arc<dyn FallbackResolver>,
        processes: Arc<dyn ProcessResolver>,
    ) -> Self {
        Self { page_table, fallback, processes, pacer: Arc::new(ThreadPacer) }
    }

    /// Replaces the pacer.
    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }
}

/// State of one coherence session. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct ClientContext {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) permissions: PermissionStore,
    pub(crate) ledger: Arc<PendingLockLedger>,
    pub(crate) throttle: Arc<WriteThrottle>,
    pub(crate) targets: Arc<TargetSet>,
    pub(crate) fallback: Arc<dyn FallbackResolver>,
    pub(crate) outbox: Outbox,
    pub(crate) monitors: MonitorSet,
    pub(crate) pacer: Arc<dyn Pacer>,
}

impl ClientContext {
    /// Builds the context of a session sending through `outbox`.
    pub fn new(config: ClientConfig, env: ClientEnv, outbox: Outbox) -> Self {
        let targets = TargetSet::new(config.targets.clone(), env.processes);
        Self {
            throttle: Arc::new(WriteThrottle::new(config.write_request_interval)),
            config: Arc::new(config),
            permissions: PermissionStore::new(env.page_table),
            ledger: Arc::new(PendingLockLedger::new()),
            targets: Arc::new(targets),
            fallback: env.fallback,
            outbox,
            monitors: MonitorSet::default(),
            pacer: env.pacer,
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Page Permission Store of this host.
    pub fn permissions(&self) -> &PermissionStore {
        &self.permissions
    }

    /// Pending Lock Ledger of this session.
    pub fn ledger(&self) -> &PendingLockLedger {
        &self.ledger
    }

    /// Write monitors spawned by this session.
    pub fn monitors(&self) -> &MonitorSet {
        &self.monitors
    }

    /// Returns `false` once the coordinator connection is lost or shut down.
    pub fn is_open(&self) -> bool {
        self.outbox.is_open()
    }
}
