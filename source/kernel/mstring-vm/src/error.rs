// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the VM core and its errno mapping
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmError, VmResult, ProtocolFault, errno::*
//! INVARIANTS: Every fallible VM path returns VmError; invariant violations assert instead

use thiserror::Error;

use crate::ipc::IpcError;

/// Result alias used across the VM core.
pub type VmResult<T> = Result<T, VmError>;

/// Negative errno values returned to userspace.
pub mod errno {
    pub const EPERM: isize = -1;
    pub const EIO: isize = -5;
    pub const ENOMEM: isize = -12;
    pub const EACCES: isize = -13;
    pub const EFAULT: isize = -14;
    pub const EBUSY: isize = -16;
    pub const EINVAL: isize = -22;
    pub const ENOSYS: isize = -38;
    pub const ENOTSUP: isize = -95;
    pub const ECANCELED: isize = -125;
}

/// Reasons a proxy backend reply is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    /// Reply frame had the wrong type, length or a non-canonical address.
    #[error("malformed reply")]
    Malformed,
    /// Reply address lies outside every VM range of the server.
    #[error("reply address outside server ranges")]
    NoRange,
    /// Reply address belongs to a range backed by another memory object.
    #[error("reply address backed by a foreign memory object")]
    ForeignObject,
    /// Reply address maps a different page offset than the one requested.
    #[error("reply offset mismatch")]
    OffsetMismatch,
    /// The server has no translation for the address it returned.
    #[error("reply address not mapped in server")]
    NotMapped,
}

/// Errors produced by the page-table, memory-object and fault layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// Frame, directory or bookkeeping allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// No valid translation, or the memory object rejects the access.
    #[error("bad address")]
    Fault,
    /// A mapping already exists where a fresh one was requested.
    #[error("mapping busy")]
    Busy,
    /// The memory-object nature does not implement the operation.
    #[error("operation not supported")]
    NotSupported,
    /// The memory object is inactive.
    #[error("operation canceled")]
    Canceled,
    /// Caller supplied an out-of-range or inconsistent argument.
    #[error("invalid argument")]
    InvalidArgs,
    /// The backend or the caller's rights deny the request.
    #[error("permission denied")]
    PermissionDenied,
    /// The proxy backend replied with garbage.
    #[error("protocol fault: {0}")]
    ProtocolFault(ProtocolFault),
    /// The proxy backend reported a non-zero status.
    #[error("backend status {status}")]
    Backend { status: i64 },
}

impl VmError {
    /// Negative errno for the syscall boundary.
    pub const fn errno(self) -> isize {
        match self {
            Self::OutOfMemory => errno::ENOMEM,
            Self::Fault => errno::EFAULT,
            Self::Busy => errno::EBUSY,
            Self::NotSupported => errno::ENOTSUP,
            Self::Canceled => errno::ECANCELED,
            Self::InvalidArgs => errno::EINVAL,
            Self::PermissionDenied => errno::EPERM,
            Self::ProtocolFault(
                ProtocolFault::Malformed | ProtocolFault::NoRange | ProtocolFault::NotMapped,
            ) => errno::EFAULT,
            Self::ProtocolFault(ProtocolFault::ForeignObject | ProtocolFault::OffsetMismatch) => {
                errno::EINVAL
            }
            Self::Backend { .. } => errno::EIO,
        }
    }
}

impl From<ProtocolFault> for VmError {
    fn from(value: ProtocolFault) -> Self {
        Self::ProtocolFault(value)
    }
}

impl From<IpcError> for VmError {
    fn from(value: IpcError) -> Self {
        match value {
            IpcError::Disconnected => Self::Fault,
            IpcError::QueueFull => Self::OutOfMemory,
            IpcError::Malformed => Self::ProtocolFault(ProtocolFault::Malformed),
        }
    }
}
