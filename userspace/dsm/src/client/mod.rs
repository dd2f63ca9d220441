// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Client coherence engine (fault path, listener, write monitor)
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/scenarios.rs
//!
//! PUBLIC API:
//!   - AccessMonitor: synchronous fault dispatcher, never blocks
//!   - ClientSession: connection, listener thread and session context
//!   - PermissionStore: per-page flags over a PageTable
//!   - PendingLockLedger: read blocks recorded before a mapping exists
//!   - QuiescenceMonitor: commits a page once its writer goes quiet
//!
//! INVARIANTS:
//!   - Every fault ends with the faulting thread able to make progress
//!   - Outbound frames from the fault path, the listener and write monitors
//!     are serialized through one send lock (`Outbox`)
//!   - The ledger and the permission store are never locked together

mod context;
mod handlers;
mod ledger;
mod monitor;
#[cfg(all(target_os = "linux", feature = "mprotect"))]
mod mprotect;
mod outbox;
mod pagetable;
mod permissions;
mod quiescence;
mod session;
mod sim;
mod targets;
mod throttle;

pub use context::{ClientContext, ClientEnv};
pub use handlers::client_dispatcher;
pub use ledger::{LedgerError, PendingLock, PendingLockLedger};
pub use monitor::{AccessKind, AccessMonitor, Fault, FaultKind, FaultOutcome};
#[cfg(all(target_os = "linux", feature = "mprotect"))]
pub use mprotect::MprotectPageTable;
pub use outbox::Outbox;
pub use pagetable::{FallbackResolver, MappingError, PageTable, PermissionFlags};
pub use permissions::PermissionStore;
pub use quiescence::{MonitorSet, Pacer, QuiescenceMonitor, QuiescenceOutcome, ThreadPacer};
pub use session::ClientSession;
pub use sim::SimPageTable;
pub use targets::{ProcessResolver, StaticResolver, TargetSet};
#[cfg(target_os = "linux")]
pub use targets::ProcfsResolver;
pub use throttle::WriteThrottle;
