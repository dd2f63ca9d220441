// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Coordinator (ownership directory, write handshake, event loop)
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/scenarios.rs, tests/tcp_transport.rs
//!
//! PUBLIC API:
//!   - OwnershipDirectory: page → lock state, cached content, holders
//!   - server_dispatcher(): InitialRead / RequestWrite / CommitPage / PingAlive
//!   - Server: acceptor + bounded connection set served by one loop
//!
//! INVARIANTS:
//!   - The directory is the single source of truth for lock state
//!   - A locked record has exactly one writer in flight
//!   - Handlers run synchronously inside the loop; a RequestWrite handshake
//!     stalls every other connection for its duration

mod commands;
mod coordinator;
mod directory;
mod event_loop;
mod peers;

pub use commands::{exchange, CommandError, CommandPolicy};
pub use coordinator::{server_dispatcher, ServerContext};
pub use directory::{ClientHandle, ConnId, DirectoryError, OwnershipDirectory, OwnershipRecord};
pub use event_loop::Server;
pub use peers::{FrameStash, Peer, PeerTable};
