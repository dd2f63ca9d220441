// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page coherence protocol for distributed shared memory
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + scenario tests (tests/)
//!
//! Several hosts share read/write access to selected pages of a target
//! process. A central coordinator (`server`) owns the lock state of every
//! shared page; each host runs a client engine (`client`) that turns memory
//! access faults into protocol requests and applies coordinator commands to
//! local page permissions.
//!
//! PUBLIC API:
//!   - page: PageIdentity, AddressSpaceId, PageData
//!   - wire: Message codec (29-byte header + 0 or one page of payload)
//!   - transport: Connection, FrameSink/FrameSource, TCP + loopback backends
//!   - dispatch: closed opcode dispatch to Handler objects
//!   - config: TOML configuration for both sides
//!   - client: AccessMonitor, PermissionStore, PendingLockLedger, ClientSession
//!   - server: OwnershipDirectory, Coordinator handlers, Server event loop
//!
//! DEPENDENCIES:
//!   - log: component logging (the daemon installs the logger)
//!   - parking_lot: coarse locks around the ledger, directory and send side
//!   - thiserror: error enums
//!   - serde/toml: configuration
//!   - libc (linux, feature `mprotect`): user-space protection trap backend

#![deny(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod page;
pub mod server;
pub mod transport;
pub mod wire;

pub use config::{ClientConfig, Config, ConfigError, QuiescencePolicy, ServerConfig};
pub use error::{Error, Result};
pub use page::{AddressSpaceId, PageData, PageIdentity, PAGE_SHIFT, PAGE_SIZE};
pub use transport::{Connection, TransportError, Wait};
pub use wire::{AckCode, Code, Message, Opcode, WireError};
