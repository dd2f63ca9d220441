// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Closed opcode dispatch to handler objects.
//!
//! Both sides register one [`Handler`] per [`Opcode`] they serve. The handler
//! gets the side's explicit context and the inbound frame and returns the
//! acknowledgement to send back; [`AckCode::NoResponse`] suppresses the reply.

use std::collections::HashMap;

use log::warn;

use crate::page::PageData;
use crate::wire::{AckCode, Message, Opcode};

/// Handler verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Reply code.
    pub code: AckCode,
    /// Optional page carried by the reply.
    pub payload: Option<PageData>,
}

impl Ack {
    /// Success reply for `op`.
    pub fn success(op: Opcode) -> Self {
        Self { code: op.ack(), payload: None }
    }

    /// Failure reply.
    pub fn failure() -> Self {
        Self { code: AckCode::OpFailure, payload: None }
    }

    /// Suppress the reply entirely.
    pub fn no_response() -> Self {
        Self { code: AckCode::NoResponse, payload: None }
    }

    /// Attaches a page to the reply.
    pub fn with_payload(mut self, page: Option<PageData>) -> Self {
        self.payload = page;
        self
    }

    /// Returns `true` for anything but `OpFailure`.
    pub fn is_success(&self) -> bool {
        self.code != AckCode::OpFailure
    }
}

/// One protocol operation.
pub trait Handler<C>: Send + Sync {
    /// Applies `msg` to `ctx` and reports the outcome.
    fn handle(&self, ctx: &mut C, msg: &Message) -> Ack;
}

impl<C, F> Handler<C> for F
where
    F: Fn(&mut C, &Message) -> Ack + Send + Sync,
{
    fn handle(&self, ctx: &mut C, msg: &Message) -> Ack {
        self(ctx, msg)
    }
}

/// Opcode → handler registry.
pub struct Dispatcher<C> {
    handlers: HashMap<Opcode, Box<dyn Handler<C>>>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self { handlers: HashMap::new() }
    }
}

impl<C> Dispatcher<C> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `op`, returning the handler it replaces.
    pub fn register(
        &mut self,
        op: Opcode,
        handler: impl Handler<C> + 'static,
    ) -> Option<Box<dyn Handler<C>>> {
        self.handlers.insert(op, Box::new(handler))
    }

    /// Returns `true` if `op` has a handler.
    pub fn handles(&self, op: Opcode) -> bool {
        self.handlers.contains_key(&op)
    }

    /// Runs the handler for a request frame and builds the reply frame.
    ///
    /// Returns `None` when the frame is not a request, no handler is
    /// registered, or the handler asked for no reply.
    pub fn dispatch(&self, ctx: &mut C, msg: &Message) -> Option<Message> {
        let Some(op) = msg.opcode() else {
            warn!("dsm: dispatch got non-request frame {:?}", msg.code);
            return None;
        };
        let Some(handler) = self.handlers.get(&op) else {
            warn!("dsm: no handler registered for {op:?}");
            return None;
        };
        let ack = handler.handle(ctx, msg);
        if ack.code == AckCode::NoResponse {
            return None;
        }
        let mut reply = msg.ack(ack.code);
        reply.payload = ack.payload;
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::AddressSpaceId;

    #[test]
    fn dispatches_by_opcode_and_echoes_fields() {
        let mut dispatcher: Dispatcher<Vec<Opcode>> = Dispatcher::new();
        dispatcher.register(Opcode::PingAlive, |seen: &mut Vec<Opcode>, msg: &Message| {
            seen.push(msg.opcode().unwrap());
            Ack::success(Opcode::PingAlive)
        });
        let mut seen = Vec::new();
        let ping = Message::request(Opcode::PingAlive, AddressSpaceId(4), 0x7000, 12);
        let reply = dispatcher.dispatch(&mut seen, &ping).unwrap();
        assert!(reply.is_ack_for(&ping, AckCode::PingAlive));
        assert_eq!(seen, vec![Opcode::PingAlive]);
    }

    #[test]
    fn unregistered_opcode_and_no_response_send_nothing() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new();
        dispatcher.register(Opcode::CommitPage, |_: &mut (), _: &Message| Ack::no_response());
        let commit = Message::request(Opcode::CommitPage, AddressSpaceId(1), 0, 1);
        assert_eq!(dispatcher.dispatch(&mut (), &commit), None);
        let lock = Message::request(Opcode::LockRead, AddressSpaceId(1), 0, 1);
        assert!(!dispatcher.handles(Opcode::LockRead));
        assert_eq!(dispatcher.dispatch(&mut (), &lock), None);
        assert_eq!(dispatcher.dispatch(&mut (), &commit.ack(AckCode::CommitPage)), None);
    }

    #[test]
    fn reply_carries_handler_payload() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new();
        dispatcher.register(Opcode::InitialRead, |_: &mut (), _: &Message| {
            Ack::success(Opcode::InitialRead).with_payload(Some(PageData::filled(1)))
        });
        let req = Message::request(Opcode::InitialRead, AddressSpaceId(1), 0, 1);
        let reply = dispatcher.dispatch(&mut (), &req).unwrap();
        assert_eq!(reply.payload, Some(PageData::filled(1)));
        assert!(!Ack::failure().is_success());
    }
}
