// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Handlers for coordinator commands received by the listener.

use log::{debug, error, info, warn};

use crate::client::context::ClientContext;
use crate::client::ledger::LedgerError;
use crate::client::quiescence::QuiescenceMonitor;
use crate::dispatch::{Ack, Dispatcher, Handler};
use crate::wire::{Message, Opcode};

/// Dispatcher serving every command a coordinator may send.
pub fn client_dispatcher() -> Dispatcher<ClientContext> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Opcode::AllowWrite, AllowWrite);
    dispatcher.register(Opcode::LockRead, LockRead);
    dispatcher.register(Opcode::ResumeRead, ResumeRead);
    dispatcher.register(Opcode::PingAlive, PingAlive);
    dispatcher
}

/// Lifts the write block and starts watching the writer.
///
/// Each WriteRequest earns one grant. A second grant before the next request
/// is a retransmission: it is acknowledged but neither reopens writes nor
/// starts another monitor, since the first monitor may already have
/// committed and released the lock.
struct AllowWrite;

impl Handler<ClientContext> for AllowWrite {
    fn handle(&self, ctx: &mut ClientContext, msg: &Message) -> Ack {
        let page = msg.page();
        let Some(writable) = ctx.permissions.writes_allowed(page) else {
            warn!("dsm-client: write grant for unmapped page {page}");
            return Ack::failure();
        };
        if !ctx.throttle.claim_grant(page) {
            debug!("dsm-client: duplicate write grant for {page}");
            return Ack::success(Opcode::AllowWrite);
        }
        if !writable {
            if let Err(err) = ctx.permissions.allow_writes(page) {
                warn!("dsm-client: unblocking writes on {page} failed: {err}");
                return Ack::failure();
            }
        }
        if let Err(err) = ctx.monitors.spawn(QuiescenceMonitor::new(ctx, msg)) {
            error!("dsm-client: cannot start write monitor for {page}: {err}");
            if let Err(err) = ctx.permissions.block_writes(page) {
                debug!("dsm-client: re-blocking writes on {page} failed: {err}");
            }
            return Ack::failure();
        }
        info!("dsm-client: write granted on {page}");
        Ack::success(Opcode::AllowWrite)
    }
}

/// Blocks reads, recording the block so a later mapping honours it too.
///
/// Always acknowledges success: a holder failing to lock would otherwise
/// fail the writer's whole handshake.
struct LockRead;

impl Handler<ClientContext> for LockRead {
    fn handle(&self, ctx: &mut ClientContext, msg: &Message) -> Ack {
        let page = msg.page();
        let fresh = ctx.ledger.add_or_reset(page);
        if ctx.permissions.is_mapped(page) {
            if let Err(err) = ctx.permissions.block_reads(page) {
                debug!("dsm-client: read block on {page} deferred: {err}");
            }
        }
        debug!("dsm-client: read lock on {page} (new entry: {fresh})");
        Ack::success(Opcode::LockRead)
    }
}

/// Resolves the pending lock with the committed content.
struct ResumeRead;

impl Handler<ClientContext> for ResumeRead {
    fn handle(&self, ctx: &mut ClientContext, msg: &Message) -> Ack {
        let page = msg.page();
        match ctx.ledger.resolve(page, msg.payload.clone()) {
            Ok(()) => debug!("dsm-client: read lock on {page} resolved"),
            Err(LedgerError::NotPending(_)) => {
                warn!("dsm-client: resume for {page} without pending lock");
                if ctx.permissions.is_mapped(page) {
                    if let Some(content) = &msg.payload {
                        if let Err(err) = ctx.permissions.install(page, content) {
                            warn!("dsm-client: installing {page} failed: {err}");
                        }
                    }
                    if let Err(err) = ctx.permissions.allow_reads(page) {
                        debug!("dsm-client: unblocking reads on {page} failed: {err}");
                    }
                }
            }
        }
        Ack::success(Opcode::ResumeRead)
    }
}

struct PingAlive;

impl Handler<ClientContext> for PingAlive {
    fn handle(&self, _ctx: &mut ClientContext, _msg: &Message) -> Ack {
        Ack::success(Opcode::PingAlive)
    }
}
