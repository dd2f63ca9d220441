// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Coordinator event loop
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (loopback) + tests/tcp_transport.rs
//!
//! One thread accepts connections and sweeps every attached connection for
//! ready frames, serving each through the dispatcher. A peer's backlog (frames
//! stashed while a command awaited its ack) is drained before new frames are
//! read. Handlers run inline: a RequestWrite handshake holds the loop until
//! every command it issues is acknowledged or exhausted.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::server::commands::CommandPolicy;
use crate::server::coordinator::{server_dispatcher, ServerContext};
use crate::server::directory::{ConnId, OwnershipDirectory};
use crate::server::peers::PeerTable;
use crate::transport::{Connection, TransportError};
use crate::wire::{Code, Message};

/// Frames served per connection per sweep, so one chatty client cannot
/// starve the others.
const FRAMES_PER_SWEEP: usize = 32;

/// The coordinator.
pub struct Server {
    listener: Option<TcpListener>,
    ctx: ServerContext,
    dispatcher: Dispatcher<ServerContext>,
    config: ServerConfig,
}

impl Server {
    /// Coordinator without a listening socket; connections are attached
    /// explicitly.
    pub fn new(config: ServerConfig) -> Self {
        let peers = PeerTable::new(config.max_connections, config.backlog_limit);
        let ctx = ServerContext::new(
            Arc::new(OwnershipDirectory::new()),
            peers,
            CommandPolicy::from_config(&config),
        );
        Self { listener: None, ctx, dispatcher: server_dispatcher(), config }
    }

    /// Coordinator listening on `config.listen`.
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen.as_str())?;
        listener.set_nonblocking(true)?;
        let mut server = Self::new(config);
        server.listener = Some(listener);
        Ok(server)
    }

    /// Bound address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Shared ownership directory.
    pub fn directory(&self) -> Arc<OwnershipDirectory> {
        self.ctx.directory().clone()
    }

    /// Attached connections.
    pub fn connections(&self) -> usize {
        self.ctx.peers().len()
    }

    /// Attaches a connection; refused (and closed) when the table is full.
    pub fn attach(&mut self, conn: Connection) -> Option<ConnId> {
        let label = conn.peer().to_owned();
        match self.ctx.peers_mut().insert(conn) {
            Ok(id) => {
                info!("dsmd: {label} attached as {id}");
                Some(id)
            }
            Err(mut conn) => {
                warn!(
                    "dsmd: refusing {label}: {} connections attached",
                    self.config.max_connections
                );
                conn.close();
                None
            }
        }
    }

    /// Accepts pending connections and serves every ready frame once.
    ///
    /// Returns the number of frames served.
    pub fn poll_once(&mut self) -> usize {
        self.accept_pending();
        let mut served = 0;
        for id in self.ctx.peers().ids() {
            for _ in 0..FRAMES_PER_SWEEP {
                let Some(peer) = self.ctx.peers_mut().get_mut(id) else { break };
                match peer.next_frame() {
                    Ok(msg) => {
                        served += 1;
                        self.serve(id, msg);
                        if self.ctx.lost.contains(&id) {
                            break;
                        }
                    }
                    Err(TransportError::WouldBlock | TransportError::Timeout) => break,
                    Err(err) => {
                        match err {
                            TransportError::Closed => debug!("dsmd: {id} closed"),
                            err => warn!("dsmd: {id} failed: {err}"),
                        }
                        self.ctx.lost.push(id);
                        break;
                    }
                }
            }
        }
        self.reap();
        served
    }

    /// Serves until `stop` is raised, sleeping between idle sweeps.
    pub fn serve_until(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            if self.poll_once() == 0 {
                thread::sleep(self.config.poll_interval());
            }
        }
        for id in self.ctx.peers().ids() {
            self.ctx.peers_mut().remove(id);
        }
        info!("dsmd: event loop stopped");
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = &self.listener else { return };
            match listener.accept() {
                Ok((stream, addr)) => match Connection::tcp(stream) {
                    Ok(conn) => {
                        self.attach(conn);
                    }
                    Err(err) => warn!("dsmd: configuring {addr} failed: {err}"),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("dsmd: accept failed: {err}");
                    return;
                }
            }
        }
    }

    fn serve(&mut self, id: ConnId, msg: Message) {
        if let Code::Ack(code) = msg.code {
            // Acks only matter while a command waits for them.
            debug!("dsmd: late {code:?} from {id} for {}", msg.page());
            return;
        }
        self.ctx.set_origin(id);
        let Some(reply) = self.dispatcher.dispatch(&mut self.ctx, &msg) else { return };
        let Some(peer) = self.ctx.peers_mut().get_mut(id) else { return };
        if let Err(err) = peer.send(&reply) {
            warn!("dsmd: replying {:?} to {id} failed: {err}", reply.code);
            if err.is_fatal() && !self.ctx.lost.contains(&id) {
                self.ctx.lost.push(id);
            }
        }
    }

    fn reap(&mut self) {
        for id in self.ctx.take_lost() {
            if self.ctx.peers_mut().remove(id).is_none() {
                continue;
            }
            let released = self.ctx.directory().drop_connection(id);
            for page in &released {
                warn!("dsmd: {id} dropped mid-write; {page} unlocked");
            }
            info!("dsmd: {id} detached");
        }
    }
}
