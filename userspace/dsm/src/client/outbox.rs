// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared send side of the coordinator connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{FrameSink, TransportError};
use crate::wire::Message;

struct OutboxInner {
    sink: Mutex<Box<dyn FrameSink>>,
    open: AtomicBool,
}

/// Serializes every outbound frame of a session through one lock.
///
/// The fault path, the listener and write monitors all hold clones.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

impl Outbox {
    /// Wraps the sending half of a connection.
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self { inner: Arc::new(OutboxInner { sink: Mutex::new(sink), open: AtomicBool::new(true) }) }
    }

    /// Sends one frame. A fatal transport error closes the outbox.
    pub fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let result = self.inner.sink.lock().send(msg);
        if let Err(err) = &result {
            if err.is_fatal() {
                self.inner.open.store(false, Ordering::Release);
            }
        }
        result
    }

    /// Returns `false` once the session's connection is gone.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Closes the connection; later sends fail with `Closed`.
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.sink.lock().close();
    }
}
