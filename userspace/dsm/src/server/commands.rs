// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Server→client command exchange with bounded retry
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (loopback peers)
//!
//! A command is sent, then the peer is read until the matching
//! acknowledgement arrives or the attempt deadline passes. Requests the peer
//! sends meanwhile are stashed on the peer's backlog so the event loop serves
//! them afterwards. Each expired attempt resends the command; a duplicate
//! LockRead, ResumeRead or PingAlive is harmless on the client.
//!
//! AllowWrite is never resent: it is delivered once and waited on for the
//! whole retry budget, since a duplicate grant could arrive after the
//! writer already committed.

use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::server::directory::ConnId;
use crate::server::peers::Peer;
use crate::transport::{TransportError, Wait};
use crate::wire::{AckCode, Code, Message, Opcode};

/// Timeout and attempt budget of one command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandPolicy {
    /// Per-attempt wait for the acknowledgement.
    pub timeout: Duration,
    /// Attempts before giving up (at least one is always made).
    pub retries: u32,
}

impl CommandPolicy {
    /// Policy from the coordinator settings.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self { timeout: config.command_timeout(), retries: config.command_retries }
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Why a command did not complete.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The target connection is no longer attached.
    #[error("{0} is not connected")]
    PeerGone(ConnId),
    /// The connection failed while the command was in flight.
    #[error("command transport: {0}")]
    Transport(#[from] TransportError),
    /// No acknowledgement within the retry budget.
    #[error("{op:?} unacknowledged after {attempts} attempts")]
    Exhausted {
        /// Command opcode.
        op: Opcode,
        /// Attempts made.
        attempts: u32,
    },
    /// The client answered with `OpFailure`.
    #[error("{op:?} refused by client")]
    Refused {
        /// Command opcode.
        op: Opcode,
    },
}

impl CommandError {
    /// Returns `true` when the connection itself is unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            CommandError::Transport(err) => err.is_fatal(),
            CommandError::PeerGone(_) => true,
            _ => false,
        }
    }
}

/// Sends `command` to `peer` and waits for its acknowledgement.
pub fn exchange(peer: &mut Peer, command: &Message, policy: &CommandPolicy) -> Result<(), CommandError> {
    let Some(op) = command.opcode() else {
        // Only requests have acknowledgements to wait for.
        peer.send(command)?;
        return Ok(());
    };
    let expected = op.ack();
    let budget = policy.retries.max(1);
    let (attempts, timeout) = match op {
        Opcode::AllowWrite => (1, policy.timeout.saturating_mul(budget)),
        _ => (budget, policy.timeout),
    };
    for attempt in 1..=attempts {
        peer.send(command)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let frame = match peer.recv(Wait::Timeout(remaining)) {
                Ok(frame) => frame,
                Err(TransportError::Timeout | TransportError::WouldBlock) => break,
                Err(err) => return Err(err.into()),
            };
            match frame.code {
                Code::Op(_) => {
                    if let Some(evicted) = peer.backlog.push(frame) {
                        warn!(
                            "dsmd: {} backlog full, dropped {:?} for {}",
                            peer.id(),
                            evicted.code,
                            evicted.page()
                        );
                    }
                }
                Code::Ack(_) if frame.is_ack_for(command, expected) => {
                    return Ok(());
                }
                Code::Ack(AckCode::OpFailure) if frame.echoes(command) => {
                    return Err(CommandError::Refused { op });
                }
                Code::Ack(code) => {
                    debug!("dsmd: {} stray {code:?} while awaiting {expected:?}", peer.id());
                }
            }
        }
        debug!("dsmd: {op:?} to {} attempt {attempt}/{attempts} timed out", peer.id());
    }
    Err(CommandError::Exhausted { op, attempts })
}
