// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded set of client connections served by the coordinator.

use std::collections::{BTreeMap, VecDeque};

use crate::server::directory::ConnId;
use crate::transport::{Connection, TransportError, Wait};
use crate::wire::Message;

/// Bounded FIFO of requests that arrived while a command awaited its ack.
///
/// Unrelated frames are never dropped silently: when full, the oldest entry
/// is evicted and counted.
#[derive(Debug)]
pub struct FrameStash {
    frames: VecDeque<Message>,
    capacity: usize,
    drops: u64,
}

impl FrameStash {
    /// Stash holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self { frames: VecDeque::with_capacity(capacity), capacity, drops: 0 }
    }

    /// Appends a frame, evicting the oldest one when full.
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&mut self, frame: Message) -> Option<Message> {
        if self.capacity == 0 {
            self.drops = self.drops.saturating_add(1);
            return Some(frame);
        }
        let evicted = if self.frames.len() == self.capacity {
            self.drops = self.drops.saturating_add(1);
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Oldest stashed frame.
    pub fn pop(&mut self) -> Option<Message> {
        self.frames.pop_front()
    }

    /// Frames currently stashed.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if nothing is stashed.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames evicted because the stash was full.
    pub fn drops(&self) -> u64 {
        self.drops
    }
}

/// One attached client connection.
pub struct Peer {
    id: ConnId,
    conn: Connection,
    /// Requests deferred until the loop is free to serve them.
    pub backlog: FrameStash,
}

impl Peer {
    /// Connection id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Peer label for logs.
    pub fn label(&self) -> &str {
        self.conn.peer()
    }

    /// Sends one frame.
    pub fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        self.conn.send(msg)
    }

    /// Receives one frame from the connection (not from the backlog).
    pub fn recv(&mut self, wait: Wait) -> Result<Message, TransportError> {
        self.conn.recv(wait)
    }

    /// Next frame to serve: the backlog first, then the connection.
    pub fn next_frame(&mut self) -> Result<Message, TransportError> {
        match self.backlog.pop() {
            Some(frame) => Ok(frame),
            None => self.conn.recv(Wait::NonBlocking),
        }
    }

    fn close(&mut self) {
        self.conn.close();
    }
}

/// Connections keyed by id, bounded in size.
pub struct PeerTable {
    peers: BTreeMap<ConnId, Peer>,
    next_id: u64,
    capacity: usize,
    backlog_limit: usize,
}

impl PeerTable {
    /// Table admitting at most `capacity` connections.
    pub fn new(capacity: usize, backlog_limit: usize) -> Self {
        Self { peers: BTreeMap::new(), next_id: 1, capacity, backlog_limit }
    }

    /// Attaches `conn`, or hands it back when the table is full.
    pub fn insert(&mut self, conn: Connection) -> Result<ConnId, Connection> {
        if self.peers.len() >= self.capacity {
            return Err(conn);
        }
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.peers.insert(id, Peer { id, conn, backlog: FrameStash::new(self.backlog_limit) });
        Ok(id)
    }

    /// Peer by id.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Detaches and closes a peer.
    pub fn remove(&mut self, id: ConnId) -> Option<Peer> {
        let mut peer = self.peers.remove(&id)?;
        peer.close();
        Some(peer)
    }

    /// Attached ids in attach order.
    pub fn ids(&self) -> Vec<ConnId> {
        self.peers.keys().copied().collect()
    }

    /// Attached connections.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` when nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
