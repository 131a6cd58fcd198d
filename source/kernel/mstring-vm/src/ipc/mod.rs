// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel side of the channel used to reach pager servers.
//!
//! The transport itself (ports, endpoint queues, blocking) lives outside the
//! VM core; this module only fixes the message shape and the call contract.

use alloc::vec::Vec;

pub mod header;

use header::{MessageHeader, HEADER_LEN};

/// Error returned by channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The peer closed its end of the channel.
    Disconnected,
    /// The peer queue is full.
    QueueFull,
    /// A frame could not be parsed.
    Malformed,
}

/// Message combining header and inline payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message and truncates the payload length to match `header.len`.
    pub fn new(header: MessageHeader, payload: Vec<u8>) -> Self {
        let mut payload = payload;
        payload.truncate(header.len as usize);
        Self { header, payload }
    }

    /// Encodes header and payload into one contiguous frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len());
        frame.extend_from_slice(&self.header.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Decodes a frame produced by [`Message::to_frame`].
    pub fn from_frame(frame: &[u8]) -> Result<Self, IpcError> {
        let header = MessageHeader::parse(frame).ok_or(IpcError::Malformed)?;
        let body = &frame[HEADER_LEN..];
        if body.len() != header.len as usize {
            return Err(IpcError::Malformed);
        }
        Ok(Self { header, payload: body.to_vec() })
    }
}

/// Synchronous request/reply channel owned by a proxy memory object.
///
/// `call` blocks the calling kernel thread until the server replies; callers
/// must not hold page-table or VM-range locks across it.
pub trait Channel: Send + Sync {
    /// Sends `request` and waits for the matching reply.
    fn call(&self, request: Message) -> Result<Message, IpcError>;

    /// Sends a one-way notification.
    fn notify(&self, message: Message) -> Result<(), IpcError>;
}
