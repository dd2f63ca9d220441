// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Coordinator operations (join, write handshake, commit, liveness)
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (loopback peers) + tests/scenarios.rs
//!
//! INVARIANTS:
//!   - RequestWrite acks only after every other holder acked LockRead and the
//!     requester acked AllowWrite
//!   - Any failed handshake step releases the lock and answers OpFailure
//!   - CommitPage stores the content before any ResumeRead is sent
//!
//! TEST_SCENARIOS:
//!   - RequestWrite on an unknown page fails without sending commands
//!   - Full handshake: LockRead fan-out, AllowWrite, commit, ResumeRead fan-out
//!   - Silent holder: handshake fails and the page unlocks

use std::sync::Arc;

use log::{debug, info, warn};

use crate::dispatch::{Ack, Dispatcher};
use crate::server::commands::{exchange, CommandError, CommandPolicy};
use crate::server::directory::{ClientHandle, ConnId, OwnershipDirectory};
use crate::server::peers::PeerTable;
use crate::wire::{Message, Opcode};

/// State the coordinator handlers operate on.
pub struct ServerContext {
    pub(crate) directory: Arc<OwnershipDirectory>,
    pub(crate) peers: PeerTable,
    pub(crate) policy: CommandPolicy,
    /// Connection the frame being dispatched arrived on.
    pub(crate) origin: ConnId,
    /// Connections found dead while running commands; reaped by the loop.
    pub(crate) lost: Vec<ConnId>,
}

impl ServerContext {
    /// Context over an attached peer table.
    pub fn new(directory: Arc<OwnershipDirectory>, peers: PeerTable, policy: CommandPolicy) -> Self {
        Self { directory, peers, policy, origin: ConnId(0), lost: Vec::new() }
    }

    /// Shared ownership directory.
    pub fn directory(&self) -> &Arc<OwnershipDirectory> {
        &self.directory
    }

    /// Attached connections.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Mutable access to the attached connections.
    pub fn peers_mut(&mut self) -> &mut PeerTable {
        &mut self.peers
    }

    /// Marks `conn` as the origin of the next dispatched frame.
    pub fn set_origin(&mut self, conn: ConnId) {
        self.origin = conn;
    }

    /// Connections lost since the last call.
    pub fn take_lost(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.lost)
    }

    fn requester(&self, msg: &Message) -> ClientHandle {
        ClientHandle { conn: self.origin, space: msg.space, pid: msg.client_pid }
    }

    /// Runs one command against `target` on its own connection.
    fn command(&mut self, target: ClientHandle, command: &Message) -> Result<(), CommandError> {
        let Some(peer) = self.peers.get_mut(target.conn) else {
            return Err(CommandError::PeerGone(target.conn));
        };
        let result = exchange(peer, command, &self.policy);
        if let Err(err) = &result {
            if err.is_fatal() && !self.lost.contains(&target.conn) {
                self.lost.push(target.conn);
            }
        }
        result
    }
}

/// Registry serving the four client requests.
pub fn server_dispatcher() -> Dispatcher<ServerContext> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Opcode::InitialRead, initial_read);
    dispatcher.register(Opcode::RequestWrite, request_write);
    dispatcher.register(Opcode::CommitPage, commit_page);
    dispatcher.register(Opcode::PingAlive, |_: &mut ServerContext, _: &Message| {
        Ack::success(Opcode::PingAlive)
    });
    dispatcher
}

fn initial_read(ctx: &mut ServerContext, msg: &Message) -> Ack {
    let page = msg.page();
    match ctx.directory.join(page, ctx.requester(msg)) {
        Ok(cached) => {
            debug!("dsmd: pid {} joined {page} on {}", msg.client_pid, ctx.origin);
            Ack::success(Opcode::InitialRead).with_payload(cached)
        }
        Err(err) => {
            warn!("dsmd: InitialRead refused: {err}");
            Ack::failure()
        }
    }
}

fn request_write(ctx: &mut ServerContext, msg: &Message) -> Ack {
    let page = msg.page();
    let requester = ctx.requester(msg);
    let others = match ctx.directory.begin_write(page, requester) {
        Ok(others) => others,
        Err(err) => {
            debug!("dsmd: RequestWrite refused: {err}");
            return Ack::failure();
        }
    };
    for holder in others {
        let lock = Message::request(Opcode::LockRead, holder.space, msg.vaddr, holder.pid);
        if let Err(err) = ctx.command(holder, &lock) {
            warn!("dsmd: LockRead to pid {} on {} failed: {err}", holder.pid, holder.conn);
            ctx.directory.abort_write(page);
            return Ack::failure();
        }
    }
    let grant = Message::request(Opcode::AllowWrite, msg.space, msg.vaddr, msg.client_pid);
    if let Err(err) = ctx.command(requester, &grant) {
        warn!("dsmd: AllowWrite to pid {} failed: {err}", msg.client_pid);
        ctx.directory.abort_write(page);
        return Ack::failure();
    }
    info!("dsmd: {page} granted to pid {} on {}", msg.client_pid, ctx.origin);
    Ack::success(Opcode::RequestWrite)
}

fn commit_page(ctx: &mut ServerContext, msg: &Message) -> Ack {
    let page = msg.page();
    let Some(content) = msg.payload.clone() else {
        warn!("dsmd: CommitPage for {page} without content");
        return Ack::failure();
    };
    let others = match ctx.directory.commit(page, ctx.requester(msg), content.clone()) {
        Ok(others) => others,
        Err(err) => {
            warn!("dsmd: CommitPage refused: {err}");
            return Ack::failure();
        }
    };
    for holder in others {
        let resume = Message::request(Opcode::ResumeRead, holder.space, msg.vaddr, holder.pid)
            .with_payload(content.clone());
        if let Err(err) = ctx.command(holder, &resume) {
            // The page is already unlocked; the holder stays blocked until
            // the next commit reaches it.
            warn!("dsmd: ResumeRead to pid {} on {} failed: {err}", holder.pid, holder.conn);
        }
    }
    debug!("dsmd: {page} committed by pid {}", msg.client_pid);
    Ack::success(Opcode::CommitPage)
}
