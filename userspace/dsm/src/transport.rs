// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Framed message transport for the coherence protocol
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (loopback) + tests/tcp_transport.rs
//!
//! PUBLIC API:
//!   - Wait: receive behaviour (blocking, non-blocking, bounded)
//!   - FrameSink / FrameSource: the two halves of a connection
//!   - Connection: a persistent stream carrying `Message` frames
//!   - connection_pair(): in-process loopback for tests and embedding
//!
//! INVARIANTS:
//!   - One `send` writes one whole frame; callers sharing a sink serialize sends
//!   - Per-connection delivery preserves send order
//!   - A malformed frame poisons the stream: the source reports it and the
//!     connection is treated as lost

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::wire::{Message, WireError, MAX_FRAME_LEN};

/// Behaviour of a receive call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until a frame arrives.
    Blocking,
    /// Return immediately if no frame is buffered.
    NonBlocking,
    /// Block until a frame arrives or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the call must not block.
    pub fn is_non_blocking(&self) -> bool {
        matches!(self, Wait::NonBlocking)
    }

    /// Returns the timeout associated with the wait mode, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Wait::Timeout(duration) => Some(*duration),
            _ => None,
        }
    }
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the stream or the stream failed. Fatal to the connection.
    #[error("connection closed")]
    Closed,
    /// Bounded receive expired without a frame.
    #[error("receive timed out")]
    Timeout,
    /// Non-blocking receive found no complete frame.
    #[error("no frame available")]
    WouldBlock,
    /// Underlying socket error.
    #[error("transport io: {0}")]
    Io(#[from] io::Error),
    /// Peer sent a frame the codec rejects.
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
}

impl TransportError {
    /// Returns `true` when the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Io(_) | TransportError::Wire(_))
    }
}

/// Sending half of a connection.
pub trait FrameSink: Send {
    /// Writes one complete frame.
    fn send(&mut self, msg: &Message) -> Result<(), TransportError>;

    /// Stops further traffic in both directions where the backend supports it.
    fn close(&mut self) {}
}

/// Receiving half of a connection.
pub trait FrameSource: Send {
    /// Reads the next frame according to `wait`.
    fn recv(&mut self, wait: Wait) -> Result<Message, TransportError>;
}

/// A persistent, bidirectional frame stream to one peer.
pub struct Connection {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
    peer: String,
}

impl Connection {
    /// Assembles a connection from two halves.
    pub fn new(sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>, peer: impl Into<String>) -> Self {
        Self { sink, source, peer: peer.into() }
    }

    /// Wraps an established TCP stream.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_else(|_| "tcp".into());
        let reader = stream.try_clone()?;
        Ok(Self::new(
            Box::new(TcpSink { stream }),
            Box::new(TcpSource::new(reader)),
            peer,
        ))
    }

    /// Connects to a coordinator over TCP.
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Self::tcp(TcpStream::connect(addr)?)
    }

    /// Human-readable peer label for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one frame.
    pub fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        self.sink.send(msg)
    }

    /// Receives one frame.
    pub fn recv(&mut self, wait: Wait) -> Result<Message, TransportError> {
        self.source.recv(wait)
    }

    /// Closes the connection.
    pub fn close(&mut self) {
        self.sink.close();
    }

    /// Splits into independently owned halves.
    pub fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Accumulates stream bytes until whole frames are available.
#[derive(Default)]
struct FrameBuffer {
    bytes: Vec<u8>,
}

impl FrameBuffer {
    fn take_frame(&mut self) -> Result<Option<Message>, WireError> {
        match Message::decode_prefix(&self.bytes)? {
            Some((msg, used)) => {
                self.bytes.drain(..used);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }
}

struct TcpSink {
    stream: TcpStream,
}

impl FrameSink for TcpSink {
    fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let frame = msg.encode();
        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => written += n,
                // The shared socket may be in non-blocking mode while the
                // source polls; keep pushing until the frame is out.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(map_io(err)),
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct TcpSource {
    stream: TcpStream,
    buffer: FrameBuffer,
    chunk: Box<[u8]>,
}

impl TcpSource {
    fn new(stream: TcpStream) -> Self {
        Self { stream, buffer: FrameBuffer::default(), chunk: vec![0u8; MAX_FRAME_LEN].into_boxed_slice() }
    }
}

impl FrameSource for TcpSource {
    fn recv(&mut self, wait: Wait) -> Result<Message, TransportError> {
        let deadline = wait.timeout().map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(msg) = self.buffer.take_frame()? {
                return Ok(msg);
            }
            match wait {
                Wait::Blocking => {
                    self.stream.set_nonblocking(false)?;
                    self.stream.set_read_timeout(None)?;
                }
                Wait::NonBlocking => self.stream.set_nonblocking(true)?,
                Wait::Timeout(_) => {
                    let remaining = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    if remaining.is_zero() {
                        return Err(TransportError::Timeout);
                    }
                    self.stream.set_nonblocking(false)?;
                    self.stream.set_read_timeout(Some(remaining))?;
                }
            }
            let read = self.stream.read(&mut self.chunk);
            if wait.is_non_blocking() {
                self.stream.set_nonblocking(false)?;
            }
            match read {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.buffer.extend(&self.chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(if wait.is_non_blocking() {
                        TransportError::WouldBlock
                    } else {
                        TransportError::Timeout
                    });
                }
                Err(err) => return Err(map_io(err)),
            }
        }
    }
}

fn map_io(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => TransportError::Closed,
        _ => TransportError::Io(err),
    }
}

/// Creates two connected in-process endpoints.
///
/// Frames cross the pair in encoded form so the receive side runs the same
/// header validation as a socket would.
pub fn connection_pair() -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        Connection::new(
            Box::new(LoopbackSink { tx: Some(a_tx) }),
            Box::new(LoopbackSource { rx: b_rx }),
            "loopback-a",
        ),
        Connection::new(
            Box::new(LoopbackSink { tx: Some(b_tx) }),
            Box::new(LoopbackSource { rx: a_rx }),
            "loopback-b",
        ),
    )
}

struct LoopbackSink {
    tx: Option<Sender<Vec<u8>>>,
}

impl FrameSink for LoopbackSink {
    fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(msg.encode()).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

struct LoopbackSource {
    rx: Receiver<Vec<u8>>,
}

impl FrameSource for LoopbackSource {
    fn recv(&mut self, wait: Wait) -> Result<Message, TransportError> {
        let frame = match wait {
            Wait::Blocking => self.rx.recv().map_err(|_| TransportError::Closed)?,
            Wait::NonBlocking => self.rx.try_recv().map_err(|err| match err {
                TryRecvError::Empty => TransportError::WouldBlock,
                TryRecvError::Disconnected => TransportError::Closed,
            })?,
            Wait::Timeout(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => TransportError::Timeout,
                RecvTimeoutError::Disconnected => TransportError::Closed,
            })?,
        };
        Ok(Message::decode(&frame)?)
    }
}
