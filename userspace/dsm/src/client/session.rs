// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Client coherence session
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/scenarios.rs
//!
//! A session owns one coordinator connection. Its listener thread receives
//! commands, dispatches them to the client handlers and sends the
//! acknowledgements; replies to the session's own requests are applied
//! directly. Losing the connection ends the session: every later fault is
//! forwarded to the fallback resolver and a new session must be started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::client::context::{ClientContext, ClientEnv};
use crate::client::handlers::client_dispatcher;
use crate::client::monitor::AccessMonitor;
use crate::client::outbox::Outbox;
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::page::AddressSpaceId;
use crate::transport::{Connection, FrameSource, TransportError, Wait};
use crate::wire::{AckCode, Code, Message, Opcode};

/// A running client session.
pub struct ClientSession {
    ctx: ClientContext,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Starts the listener on `conn`.
    pub fn start(config: ClientConfig, conn: Connection, env: ClientEnv) -> Result<Self> {
        let peer = conn.peer().to_owned();
        let (sink, source) = conn.into_split();
        let ctx = ClientContext::new(config, env, Outbox::new(sink));
        let stop = Arc::new(AtomicBool::new(false));
        let listener = {
            let ctx = ctx.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("dsm-listener".into())
                .spawn(move || listen(ctx, source, client_dispatcher(), stop))?
        };
        info!("dsm-client: session started with {peer}");
        Ok(Self { ctx, stop, listener: Some(listener) })
    }

    /// Connects to the configured coordinator over TCP and starts a session.
    pub fn connect(config: ClientConfig, env: ClientEnv) -> Result<Self> {
        let conn = Connection::connect(config.server.as_str())?;
        Self::start(config, conn, env)
    }

    /// Fault entry point bound to this session.
    pub fn monitor(&self) -> AccessMonitor {
        AccessMonitor::new(self.ctx.clone())
    }

    /// Session state shared with the listener and the fault path.
    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    /// Returns `false` once the connection is gone.
    pub fn is_open(&self) -> bool {
        self.ctx.is_open()
    }

    /// Joins the holder set of the page containing `vaddr`.
    ///
    /// The coordinator's reply is applied by the listener: a cached page is
    /// installed if the local mapping exists.
    pub fn initial_read(&self, space: AddressSpaceId, pid: u32, vaddr: u64) -> Result<()> {
        let request = Message::request(Opcode::InitialRead, space, vaddr, pid);
        self.ctx.outbox.send(&request)?;
        Ok(())
    }

    /// Sends a liveness probe; the reply is only logged.
    pub fn ping(&self, space: AddressSpaceId, pid: u32) -> Result<()> {
        self.ctx.outbox.send(&Message::request(Opcode::PingAlive, space, 0, pid))?;
        Ok(())
    }

    /// Stops the listener, closes the connection and waits for write monitors.
    pub fn shutdown(mut self) {
        self.stop_listener();
        self.ctx.monitors.join_all();
    }

    fn stop_listener(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.ctx.outbox.close();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

fn listen(
    mut ctx: ClientContext,
    mut source: Box<dyn FrameSource>,
    dispatcher: Dispatcher<ClientContext>,
    stop: Arc<AtomicBool>,
) {
    let wait = Wait::Timeout(ctx.config.recv_timeout());
    while !stop.load(Ordering::Acquire) {
        let msg = match source.recv(wait) {
            Ok(msg) => msg,
            Err(TransportError::Timeout | TransportError::WouldBlock) => continue,
            Err(err) => {
                if !stop.load(Ordering::Acquire) {
                    error!("dsm-client: coordinator connection lost: {err}");
                }
                ctx.outbox.close();
                return;
            }
        };
        match msg.code {
            Code::Op(_) => {
                if let Some(reply) = dispatcher.dispatch(&mut ctx, &msg) {
                    if let Err(err) = ctx.outbox.send(&reply) {
                        warn!("dsm-client: acknowledging {:?} failed: {err}", msg.code);
                    }
                }
            }
            Code::Ack(code) => apply_reply(&ctx, &msg, code),
        }
    }
}

/// Applies the coordinator's answer to one of the session's own requests.
fn apply_reply(ctx: &ClientContext, msg: &Message, code: AckCode) {
    let page = msg.page();
    match code {
        AckCode::InitialRead => {
            let Some(content) = &msg.payload else {
                debug!("dsm-client: joined {page} (no cached content)");
                return;
            };
            if !ctx.permissions.is_mapped(page) {
                debug!("dsm-client: joined {page}; mapping absent, content left to first touch");
                return;
            }
            match ctx.permissions.install(page, content) {
                Ok(()) => debug!("dsm-client: joined {page} with cached content"),
                Err(err) => warn!("dsm-client: installing cached {page} failed: {err}"),
            }
        }
        AckCode::RequestWrite => debug!("dsm-client: write handshake for {page} complete"),
        AckCode::CommitPage | AckCode::PingAlive => {}
        AckCode::OpFailure => {
            // Re-arm the rate limit so the next fault asks again.
            ctx.throttle.reset(page);
            warn!("dsm-client: coordinator refused request on {page}");
        }
        AckCode::AllowWrite | AckCode::LockRead | AckCode::ResumeRead | AckCode::NoResponse => {
            warn!("dsm-client: unexpected acknowledgement {code:?} for {page}");
        }
    }
}
