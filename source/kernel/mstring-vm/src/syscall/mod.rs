// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-object syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, MEMOBJ_CTL_* commands
//! DEPENDS_ON: memobj::registry, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline

pub mod api;

use core::fmt;

use crate::error::{errno, VmError};

/// Size of the dispatch window owned by the VM core.
const MAX_SYSCALL: usize = 16;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Creates a page-cache or proxy memory object.
pub const SYSCALL_MEMOBJ_CREATE: usize = 0;
/// Queries or reconfigures a memory object.
pub const SYSCALL_MEMOBJ_CTL: usize = 1;

/// `SYSCALL_MEMOBJ_CTL` sub-commands.
pub const MEMOBJ_CTL_GET_INFO: usize = 0;
pub const MEMOBJ_CTL_CHANGE_INFO: usize = 1;
pub const MEMOBJ_CTL_TRUNCATE: usize = 2;
pub const MEMOBJ_CTL_SET_BACKEND: usize = 3;
pub const MEMOBJ_CTL_GET_BACKEND: usize = 4;
pub const MEMOBJ_CTL_PUT_PAGE: usize = 5;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// VM operation failed.
    Vm(VmError),
}

impl Error {
    /// Negative errno returned to userspace.
    pub fn errno(self) -> isize {
        match self {
            Self::InvalidSyscall => errno::ENOSYS,
            Self::Vm(err) => err.errno(),
        }
    }
}

impl From<VmError> for Error {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSyscall => f.write_str("invalid syscall"),
            Self::Vm(err) => write!(f, "{}", err),
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }

    /// Dispatches and folds the outcome into the register returned to userspace.
    pub fn dispatch_raw(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> isize {
        match self.dispatch(number, ctx, args) {
            Ok(value) => value as isize,
            Err(err) => {
                log::debug!(target: "syscall", "syscall {} failed: {}", number, err);
                err.errno()
            }
        }
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
