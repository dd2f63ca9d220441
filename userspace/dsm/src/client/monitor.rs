// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Access Monitor / fault dispatcher
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (every branch) + tests/scenarios.rs
//!
//! Runs synchronously in the faulting thread for every access fault of a
//! targeted process. It only touches page flags, the ledger and the outbox;
//! it never waits for the coordinator. Grants arrive later through the
//! listener.
//!
//! INVARIANTS:
//!   - The faulting thread always makes progress: internal failures forward
//!     the fault to the fallback resolver, and without a coordinator the
//!     protocol's own blocks are lifted (data may then be stale)
//!   - An unresolved pending lock keeps a missing page unmaterialized
//!   - At most one WriteRequest per `write_request_interval` identical faults
//!
//! TEST_SCENARIOS:
//!   - read violation without pending lock self-heals
//!   - missing page with unresolved pending lock is suppressed
//!   - resolved pending lock installs content exactly once
//!   - first write touch primes, later violations request, repeats throttle

use log::{debug, warn};

use crate::client::context::ClientContext;
use crate::client::ledger::PendingLock;
use crate::page::{AddressSpaceId, PageIdentity};
use crate::wire::{Message, Opcode};

/// Kind of the faulting access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Load.
    Read,
    /// Store.
    Write,
}

/// Whether the page was mapped when the fault hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Mapping exists; its protection refused the access.
    Violation,
    /// No mapping exists yet.
    MissingPage,
}

/// One memory-access fault as delivered by the trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Address space of the faulting process.
    pub space: AddressSpaceId,
    /// Faulting process.
    pub pid: u32,
    /// Faulting address.
    pub vaddr: u64,
    /// Access kind.
    pub access: AccessKind,
    /// Mapped or missing.
    pub kind: FaultKind,
}

impl Fault {
    /// Page containing the faulting address.
    pub fn page(&self) -> PageIdentity {
        PageIdentity::containing(self.space, self.vaddr)
    }
}

/// What the monitor did with a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Handed to the fallback resolver.
    Forwarded,
    /// A stale read block was lifted.
    SelfHealed,
    /// Held back until the pending lock resolves; the access will fault again.
    Suppressed,
    /// Resolved content installed and the pending lock consumed.
    Installed,
    /// First write touch: the page is now associated and write-blocked.
    Primed,
    /// A WriteRequest went out.
    WriteRequested,
    /// The rate limit withheld the WriteRequest.
    Throttled,
}

/// Fault entry point of a session.
#[derive(Clone)]
pub struct AccessMonitor {
    ctx: ClientContext,
}

impl AccessMonitor {
    /// Monitor acting on `ctx`.
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Handles one fault. Never blocks on the coordinator.
    pub fn handle_fault(&self, fault: &Fault) -> FaultOutcome {
        if !self.ctx.outbox.is_open() {
            return self.release(fault);
        }
        if !self.ctx.targets.is_target(fault.pid) {
            return self.forward(fault);
        }
        let page = fault.page();
        let shareable = self.ctx.permissions.is_shareable(page);
        if shareable == Some(false) {
            return self.forward(fault);
        }
        match fault.access {
            AccessKind::Read => self.read_fault(fault, page),
            AccessKind::Write => self.write_fault(fault, page, shareable),
        }
    }

    fn forward(&self, fault: &Fault) -> FaultOutcome {
        self.ctx.fallback.resolve(fault);
        FaultOutcome::Forwarded
    }

    /// Coordinator unreachable: no grant or resume will ever arrive, so the
    /// block matching the access is lifted before forwarding.
    fn release(&self, fault: &Fault) -> FaultOutcome {
        let page = fault.page();
        let permissions = &self.ctx.permissions;
        if fault.kind == FaultKind::Violation && permissions.is_shareable(page) == Some(true) {
            let lifted = match fault.access {
                AccessKind::Read => permissions.allow_reads(page),
                AccessKind::Write => permissions.allow_writes(page),
            };
            match lifted {
                Ok(()) => debug!("dsm-client: released {page} without coordinator"),
                Err(err) => debug!("dsm-client: releasing {page} failed: {err}"),
            }
        }
        self.forward(fault)
    }

    fn read_fault(&self, fault: &Fault, page: PageIdentity) -> FaultOutcome {
        match (self.ctx.ledger.find(page), fault.kind) {
            (None, FaultKind::Violation) => {
                // A failed unblock just faults again on the next read.
                if let Err(err) = self.ctx.permissions.allow_reads(page) {
                    debug!("dsm-client: self-heal of {page} failed: {err}");
                }
                FaultOutcome::SelfHealed
            }
            (None, FaultKind::MissingPage) => self.forward(fault),
            (Some(lock), _) if !lock.resolved => {
                debug!("dsm-client: read of {page} held until resume");
                FaultOutcome::Suppressed
            }
            (Some(lock), FaultKind::Violation) => self.consume(page, lock),
            (Some(lock), FaultKind::MissingPage) => {
                self.ctx.fallback.resolve(fault);
                self.consume(page, lock)
            }
        }
    }

    /// Applies a resolved pending lock and deletes it.
    fn consume(&self, page: PageIdentity, lock: PendingLock) -> FaultOutcome {
        let permissions = &self.ctx.permissions;
        if let Err(err) = permissions.allow_reads(page) {
            debug!("dsm-client: resolved page {page} still unavailable: {err}");
            return FaultOutcome::Suppressed;
        }
        if let Some(content) = &lock.content {
            if let Err(err) = permissions.install(page, content) {
                warn!("dsm-client: installing resolved content of {page} failed: {err}");
                if let Err(err) = permissions.block_reads(page) {
                    debug!("dsm-client: re-blocking reads on {page} failed: {err}");
                }
                return FaultOutcome::Suppressed;
            }
        }
        self.ctx.ledger.remove(page);
        FaultOutcome::Installed
    }

    fn write_fault(&self, fault: &Fault, page: PageIdentity, shareable: Option<bool>) -> FaultOutcome {
        let mut forwarded = false;
        if shareable.is_none() {
            // Shareability is only known once a mapping exists.
            self.ctx.fallback.resolve(fault);
            forwarded = true;
            if self.ctx.permissions.is_shareable(page) != Some(true) {
                return FaultOutcome::Forwarded;
            }
        }

        let permissions = &self.ctx.permissions;
        if !permissions.is_associated(page) || fault.kind != FaultKind::Violation {
            if !forwarded {
                self.ctx.fallback.resolve(fault);
            }
            if let Err(err) = permissions.associate(page).and_then(|()| permissions.block_writes(page)) {
                debug!("dsm-client: priming {page} failed: {err}");
                return FaultOutcome::Forwarded;
            }
            return FaultOutcome::Primed;
        }

        if !self.ctx.throttle.admit(page) {
            return FaultOutcome::Throttled;
        }
        let request = Message::request(Opcode::RequestWrite, fault.space, fault.vaddr, fault.pid);
        self.ctx.throttle.note_request(page);
        match self.ctx.outbox.send(&request) {
            Ok(()) => {
                debug!("dsm-client: requested write on {page}");
                FaultOutcome::WriteRequested
            }
            Err(err) => {
                warn!("dsm-client: write request for {page} failed: {err}");
                self.ctx.throttle.reset(page);
                self.release(fault)
            }
        }
    }
}
