// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pager wire protocol between proxy memory objects and their servers
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Request, encode/decode helpers, op codes
//! DEPENDS_ON: ipc::{Message, header::MessageHeader}
//! INVARIANTS: Little-endian fixed layouts; replies echo the request type with an exact length
//!
//! | ty | request     | payload                                       | reply      |
//! |----|-------------|-----------------------------------------------|------------|
//! | 1  | PAGE_FAULT  | id u32, mask u32, tag u64, offset u64          | addr u64   |
//! | 2  | DEPOPULATE  | id u32, 0 u32, tag u64, offset u64, len u64    | status i64 |
//! | 3  | MSYNC       | id u32, 0 u32, tag u64, offset u64, len u64    | status i64 |
//! | 4  | MMAP_CHECK  | id u32, 0 u32, tag u64, offset u64, pages u64  | status i64 |
//! | 5  | UNMAP_ACK   | empty, one-way                                | none       |

use alloc::vec::Vec;

use crate::error::ProtocolFault;
use crate::ipc::header::MessageHeader;
use crate::ipc::{IpcError, Message};
use crate::types::{MemObjId, TaskId};

pub const PAGE_FAULT: u16 = 1;
pub const DEPOPULATE: u16 = 2;
pub const MSYNC: u16 = 3;
pub const MMAP_CHECK: u16 = 4;
pub const UNMAP_ACK: u16 = 5;

const PAGE_FAULT_LEN: usize = 24;
const RANGE_REQUEST_LEN: usize = 32;
const REPLY_LEN: usize = 8;

/// Kernel-originated pager request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    PageFault { id: MemObjId, mask: u32, tag: u64, offset: u64 },
    /// `len` is in bytes.
    Depopulate { id: MemObjId, tag: u64, offset: u64, len: u64 },
    /// `len` is in bytes.
    Msync { id: MemObjId, tag: u64, offset: u64, len: u64 },
    MmapCheck { id: MemObjId, tag: u64, offset: u64, pages: u64 },
    UnmapAck,
}

impl Request {
    pub const fn ty(&self) -> u16 {
        match self {
            Self::PageFault { .. } => PAGE_FAULT,
            Self::Depopulate { .. } => DEPOPULATE,
            Self::Msync { .. } => MSYNC,
            Self::MmapCheck { .. } => MMAP_CHECK,
            Self::UnmapAck => UNMAP_ACK,
        }
    }

    /// Encodes the request addressed to server task `dst`.
    pub fn encode(&self, dst: TaskId) -> Message {
        let mut payload = Vec::with_capacity(RANGE_REQUEST_LEN);
        match *self {
            Self::PageFault { id, mask, tag, offset } => {
                put_u32(&mut payload, id.as_raw());
                put_u32(&mut payload, mask);
                put_u64(&mut payload, tag);
                put_u64(&mut payload, offset);
            }
            Self::Depopulate { id, tag, offset, len: last }
            | Self::Msync { id, tag, offset, len: last }
            | Self::MmapCheck { id, tag, offset, pages: last } => {
                put_u32(&mut payload, id.as_raw());
                put_u32(&mut payload, 0);
                put_u64(&mut payload, tag);
                put_u64(&mut payload, offset);
                put_u64(&mut payload, last);
            }
            Self::UnmapAck => {}
        }
        let header = MessageHeader::new(0, dst.as_raw(), self.ty(), 0, payload.len() as u32);
        Message::new(header, payload)
    }

    /// Server-side decoding of a request frame.
    pub fn decode(msg: &Message) -> Result<Self, IpcError> {
        let p = &msg.payload;
        let request = match msg.header.ty {
            PAGE_FAULT => {
                expect_len(p, PAGE_FAULT_LEN)?;
                Self::PageFault {
                    id: MemObjId::from_raw(get_u32(p, 0)),
                    mask: get_u32(p, 4),
                    tag: get_u64(p, 8),
                    offset: get_u64(p, 16),
                }
            }
            ty @ (DEPOPULATE | MSYNC | MMAP_CHECK) => {
                expect_len(p, RANGE_REQUEST_LEN)?;
                let id = MemObjId::from_raw(get_u32(p, 0));
                let tag = get_u64(p, 8);
                let offset = get_u64(p, 16);
                let last = get_u64(p, 24);
                match ty {
                    DEPOPULATE => Self::Depopulate { id, tag, offset, len: last },
                    MSYNC => Self::Msync { id, tag, offset, len: last },
                    _ => Self::MmapCheck { id, tag, offset, pages: last },
                }
            }
            UNMAP_ACK => {
                expect_len(p, 0)?;
                Self::UnmapAck
            }
            _ => return Err(IpcError::Malformed),
        };
        Ok(request)
    }
}

/// Builds the server's reply to a PAGE_FAULT request.
pub fn encode_addr_reply(src: TaskId, addr: u64) -> Message {
    reply(src, PAGE_FAULT, addr.to_le_bytes())
}

/// Builds the server's status reply to a request of type `ty`.
pub fn encode_status_reply(src: TaskId, ty: u16, status: i64) -> Message {
    reply(src, ty, status.to_le_bytes())
}

fn reply(src: TaskId, ty: u16, body: [u8; REPLY_LEN]) -> Message {
    let header = MessageHeader::new(src.as_raw(), 0, ty, 0, REPLY_LEN as u32);
    Message::new(header, body.to_vec())
}

/// Address carried by a PAGE_FAULT reply.
pub fn decode_addr_reply(msg: &Message) -> Result<u64, ProtocolFault> {
    Ok(u64::from_le_bytes(reply_body(msg, PAGE_FAULT)?))
}

/// Status carried by the reply to a request of type `ty`.
pub fn decode_status_reply(msg: &Message, ty: u16) -> Result<i64, ProtocolFault> {
    Ok(i64::from_le_bytes(reply_body(msg, ty)?))
}

fn reply_body(msg: &Message, ty: u16) -> Result<[u8; REPLY_LEN], ProtocolFault> {
    if msg.header.ty != ty || msg.header.len as usize != REPLY_LEN {
        return Err(ProtocolFault::Malformed);
    }
    msg.payload.as_slice().try_into().map_err(|_| ProtocolFault::Malformed)
}

fn expect_len(payload: &[u8], len: usize) -> Result<(), IpcError> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(IpcError::Malformed)
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
