// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPC message header carried in front of every pager request and reply.

use static_assertions::const_assert_eq;

/// Header exchanged between the kernel and a pager task.
///
/// The header is exactly 16 bytes and therefore cache-line friendly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub src: u32,
    pub dst: u32,
    pub ty: u16,
    pub flags: u16,
    pub len: u32,
}

const_assert_eq!(core::mem::size_of::<MessageHeader>(), 16);

/// Size of the encoded header.
pub const HEADER_LEN: usize = core::mem::size_of::<MessageHeader>();

impl MessageHeader {
    /// Creates a new header with all fields initialised.
    pub const fn new(src: u32, dst: u32, ty: u16, flags: u16, len: u32) -> Self {
        Self { src, dst, ty, flags, len }
    }

    /// Serialises the header to a little-endian byte array.
    pub fn to_le_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.src.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.dst.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.ty.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    /// Deserialises a little-endian byte array into a [`MessageHeader`].
    pub fn from_le_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        let word = |range: core::ops::Range<usize>| -> u32 {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(raw)
        };
        let half = |at: usize| -> u16 { u16::from_le_bytes([bytes[at], bytes[at + 1]]) };
        Self { src: word(0..4), dst: word(4..8), ty: half(8), flags: half(10), len: word(12..16) }
    }

    /// Parses the header at the front of `frame`, if it is long enough.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let raw: [u8; HEADER_LEN] = frame.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self::from_le_bytes(raw))
    }
}
