// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Frame codec shared by coordinator and clients
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable (wire v1)
//! TEST_COVERAGE: Unit tests (codec, header validation, ack matching)
//!
//! Frame layout (little-endian, packed):
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 1    | code (opcode or ack code)     |
//! | 1      | 8    | virtual address               |
//! | 9      | 4    | client process id             |
//! | 13     | 4    | server-local process id, 0=none |
//! | 17     | 8    | address-space token           |
//! | 25     | 4    | payload length                |
//! | 29     | n    | payload, n == 0 or PAGE_SIZE  |
//!
//! INVARIANTS:
//!   - Opcodes (`0x00..=0x06`) and ack codes (`0x07..=0x0F`) never overlap
//!   - A frame with any other payload length is rejected before it is buffered

use thiserror::Error;

use crate::page::{AddressSpaceId, PageData, PageIdentity, PAGE_SIZE};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 29;
/// Largest frame the codec accepts.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + PAGE_SIZE;
/// `server_pid` value meaning "not set".
pub const NO_SERVER_PID: u32 = 0;

/// Request kinds.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    /// Client asks for write ownership of a page.
    RequestWrite = 0x00,
    /// Coordinator grants write ownership.
    AllowWrite = 0x01,
    /// Writer publishes the final page content.
    CommitPage = 0x02,
    /// Coordinator blocks reads on a holder.
    LockRead = 0x03,
    /// Coordinator unblocks reads and ships the new content.
    ResumeRead = 0x04,
    /// Client joins the holder set of a page.
    InitialRead = 0x05,
    /// Liveness probe.
    PingAlive = 0x06,
}

impl Opcode {
    /// Every opcode, in code order.
    pub const ALL: [Opcode; 7] = [
        Opcode::RequestWrite,
        Opcode::AllowWrite,
        Opcode::CommitPage,
        Opcode::LockRead,
        Opcode::ResumeRead,
        Opcode::InitialRead,
        Opcode::PingAlive,
    ];

    /// Acknowledgement code answering this opcode successfully.
    pub const fn ack(self) -> AckCode {
        match self {
            Opcode::RequestWrite => AckCode::RequestWrite,
            Opcode::AllowWrite => AckCode::AllowWrite,
            Opcode::CommitPage => AckCode::CommitPage,
            Opcode::LockRead => AckCode::LockRead,
            Opcode::ResumeRead => AckCode::ResumeRead,
            Opcode::InitialRead => AckCode::InitialRead,
            Opcode::PingAlive => AckCode::PingAlive,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }
}

/// Acknowledgement kinds.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AckCode {
    /// RequestWrite completed: the requester has been granted the page.
    RequestWrite = 0x07,
    /// AllowWrite applied.
    AllowWrite = 0x08,
    /// CommitPage stored.
    CommitPage = 0x09,
    /// LockRead applied (or recorded as pending).
    LockRead = 0x0A,
    /// ResumeRead applied (or resolved a pending lock).
    ResumeRead = 0x0B,
    /// InitialRead accepted; payload carries the cached page if any.
    InitialRead = 0x0C,
    /// PingAlive answered.
    PingAlive = 0x0D,
    /// Handler-internal sentinel: do not send any reply.
    NoResponse = 0x0E,
    /// The operation failed.
    OpFailure = 0x0F,
}

impl AckCode {
    const ALL: [AckCode; 9] = [
        AckCode::RequestWrite,
        AckCode::AllowWrite,
        AckCode::CommitPage,
        AckCode::LockRead,
        AckCode::ResumeRead,
        AckCode::InitialRead,
        AckCode::PingAlive,
        AckCode::NoResponse,
        AckCode::OpFailure,
    ];

    fn from_u8(raw: u8) -> Option<Self> {
        raw.checked_sub(AckCode::RequestWrite as u8)
            .and_then(|idx| Self::ALL.get(usize::from(idx)).copied())
    }
}

/// Either kind of frame code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// A request.
    Op(Opcode),
    /// A reply.
    Ack(AckCode),
}

impl Code {
    /// Decodes a raw code byte.
    pub fn from_u8(raw: u8) -> Result<Self, WireError> {
        if let Some(op) = Opcode::from_u8(raw) {
            return Ok(Code::Op(op));
        }
        AckCode::from_u8(raw).map(Code::Ack).ok_or(WireError::UnknownCode(raw))
    }

    /// Raw code byte.
    pub const fn as_u8(self) -> u8 {
        match self {
            Code::Op(op) => op as u8,
            Code::Ack(ack) => ack as u8,
        }
    }
}

impl From<Opcode> for Code {
    fn from(op: Opcode) -> Self {
        Code::Op(op)
    }
}

impl From<AckCode> for Code {
    fn from(ack: AckCode) -> Self {
        Code::Ack(ack)
    }
}

/// Codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// Code byte is neither an opcode nor an ack code.
    #[error("unknown message code {0:#04x}")]
    UnknownCode(u8),
    /// Payload length is neither 0 nor one page.
    #[error("payload length {0} is neither 0 nor {PAGE_SIZE}")]
    BadPayloadLength(u32),
    /// Buffer ended inside a frame.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the frame needs.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// Payload buffer could not be allocated.
    #[error("payload allocation failed")]
    Allocation,
}

/// Decoded, validated frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame code.
    pub code: Code,
    /// Faulting or target virtual address.
    pub vaddr: u64,
    /// Process id on the client host.
    pub client_pid: u32,
    /// Process id local to the coordinator, [`NO_SERVER_PID`] if unset.
    pub server_pid: u32,
    /// Coherence domain.
    pub space: AddressSpaceId,
    /// Payload length (0 or `PAGE_SIZE`).
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parses and validates the first [`HEADER_LEN`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let header: &[u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(WireError::Truncated { needed: HEADER_LEN, available: buf.len() })?;
        let code = Code::from_u8(header[0])?;
        let payload_len = u32::from_le_bytes(field(header, 25));
        if payload_len != 0 && payload_len as usize != PAGE_SIZE {
            return Err(WireError::BadPayloadLength(payload_len));
        }
        Ok(Self {
            code,
            vaddr: u64::from_le_bytes(field(header, 1)),
            client_pid: u32::from_le_bytes(field(header, 9)),
            server_pid: u32::from_le_bytes(field(header, 13)),
            space: AddressSpaceId(u64::from_le_bytes(field(header, 17))),
            payload_len,
        })
    }

    /// Length of the whole frame described by this header.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

fn field<const N: usize>(header: &[u8; HEADER_LEN], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&header[offset..offset + N]);
    out
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame code.
    pub code: Code,
    /// Virtual address inside the shared page.
    pub vaddr: u64,
    /// Process id on the client host.
    pub client_pid: u32,
    /// Process id local to the coordinator, [`NO_SERVER_PID`] if unset.
    pub server_pid: u32,
    /// Coherence domain.
    pub space: AddressSpaceId,
    /// Optional page payload.
    pub payload: Option<PageData>,
}

impl Message {
    /// Request without payload.
    pub fn request(op: Opcode, space: AddressSpaceId, vaddr: u64, client_pid: u32) -> Self {
        Self {
            code: Code::Op(op),
            vaddr,
            client_pid,
            server_pid: NO_SERVER_PID,
            space,
            payload: None,
        }
    }

    /// Attaches a page payload.
    pub fn with_payload(mut self, page: PageData) -> Self {
        self.payload = Some(page);
        self
    }

    /// Opcode if this frame is a request.
    pub fn opcode(&self) -> Option<Opcode> {
        match self.code {
            Code::Op(op) => Some(op),
            Code::Ack(_) => None,
        }
    }

    /// Ack code if this frame is a reply.
    pub fn ack_code(&self) -> Option<AckCode> {
        match self.code {
            Code::Ack(ack) => Some(ack),
            Code::Op(_) => None,
        }
    }

    /// Page the frame refers to.
    pub fn page(&self) -> PageIdentity {
        PageIdentity::containing(self.space, self.vaddr)
    }

    /// Reply echoing this frame's addressing fields.
    pub fn ack(&self, code: AckCode) -> Self {
        Self {
            code: Code::Ack(code),
            vaddr: self.vaddr,
            client_pid: self.client_pid,
            server_pid: self.server_pid,
            space: self.space,
            payload: None,
        }
    }

    /// True when `self` echoes `request` with `code` and carries no payload.
    pub fn is_ack_for(&self, request: &Message, code: AckCode) -> bool {
        self.echoes(request) && self.code == Code::Ack(code) && self.payload.is_none()
    }

    /// True when `self` carries the same addressing fields as `other`.
    pub fn echoes(&self, other: &Message) -> bool {
        self.vaddr == other.vaddr
            && self.client_pid == other.client_pid
            && self.space == other.space
    }

    /// Header describing this frame.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            code: self.code,
            vaddr: self.vaddr,
            client_pid: self.client_pid,
            server_pid: self.server_pid,
            space: self.space,
            payload_len: if self.payload.is_some() { PAGE_SIZE as u32 } else { 0 },
        }
    }

    /// Serialized frame length.
    pub fn encoded_len(&self) -> usize {
        self.header().frame_len()
    }

    /// Appends the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let header = self.header();
        out.reserve(header.frame_len());
        out.push(header.code.as_u8());
        out.extend_from_slice(&header.vaddr.to_le_bytes());
        out.extend_from_slice(&header.client_pid.to_le_bytes());
        out.extend_from_slice(&header.server_pid.to_le_bytes());
        out.extend_from_slice(&header.space.0.to_le_bytes());
        out.extend_from_slice(&header.payload_len.to_le_bytes());
        if let Some(page) = &self.payload {
            out.extend_from_slice(page.as_bytes());
        }
    }

    /// Encodes into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decodes the frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds a valid but incomplete prefix, and
    /// the message plus consumed byte count otherwise. An invalid header is
    /// rejected as soon as its 29 bytes are present.
    pub fn decode_prefix(buf: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::parse(buf)?;
        let len = header.frame_len();
        if buf.len() < len {
            return Ok(None);
        }
        let payload = if header.payload_len == 0 {
            None
        } else {
            let mut page = PageData::try_zeroed().map_err(|_| WireError::Allocation)?;
            page.as_bytes_mut().copy_from_slice(&buf[HEADER_LEN..len]);
            Some(page)
        };
        let msg = Message {
            code: header.code,
            vaddr: header.vaddr,
            client_pid: header.client_pid,
            server_pid: header.server_pid,
            space: header.space,
            payload,
        };
        Ok(Some((msg, len)))
    }

    /// Decodes exactly one frame occupying all of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        match Self::decode_prefix(buf)? {
            Some((msg, used)) if used == buf.len() => Ok(msg),
            Some((_, used)) => Err(WireError::Truncated { needed: used, available: buf.len() }),
            None => {
                let needed = FrameHeader::parse(buf).map(|h| h.frame_len()).unwrap_or(HEADER_LEN);
                Err(WireError::Truncated { needed, available: buf.len() })
            }
        }
    }
}
