// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-object syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context, CallerTask, MemObjInfo, MemObjCtlInfo
//! DEPENDS_ON: memobj::{registry, Backend}, ipc::Channel
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; kernel-owned flags never taken from userspace

use alloc::sync::{Arc, Weak};

use static_assertions::const_assert_eq;

use super::{
    Args, Error, SysResult, SyscallTable, MEMOBJ_CTL_CHANGE_INFO, MEMOBJ_CTL_GET_BACKEND,
    MEMOBJ_CTL_GET_INFO, MEMOBJ_CTL_PUT_PAGE, MEMOBJ_CTL_SET_BACKEND, MEMOBJ_CTL_TRUNCATE,
    SYSCALL_MEMOBJ_CREATE, SYSCALL_MEMOBJ_CTL,
};
use crate::error::VmError;
use crate::ipc::Channel;
use crate::memobj::{registry, Backend, MemObjFlags, MemObjRef, Nature, ServerTask};
use crate::mm::PAGE_SIZE;
use crate::types::{MemObjId, PortId};

/// Calling task as seen by the memory-object syscalls.
pub trait CallerTask {
    /// Copies `bytes` to user address `dst`; `Fault` when the range is not writable.
    fn copy_to_user(&mut self, dst: u64, bytes: &[u8]) -> Result<(), VmError>;

    /// Resolves a backend port to its server task and channel.
    fn resolve_port(&self, port: PortId) -> Option<(Weak<dyn ServerTask>, Arc<dyn Channel>)>;

    /// Takes ownership of the creator's pin on a new object.
    fn adopt_memobj(&mut self, obj: MemObjRef);
}

/// Per-call context handed to handlers.
pub struct Context<'a> {
    caller: &'a mut dyn CallerTask,
}

impl<'a> Context<'a> {
    pub fn new(caller: &'a mut dyn CallerTask) -> Self {
        Self { caller }
    }
}

/// Output record of `SYSCALL_MEMOBJ_CREATE`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemObjInfo {
    pub id: u32,
    pub flags: u32,
}

const_assert_eq!(core::mem::size_of::<MemObjInfo>(), 8);

impl MemObjInfo {
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&self.id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }
}

/// Output record of `MEMOBJ_CTL_GET_INFO`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemObjCtlInfo {
    pub id: u32,
    pub flags: u32,
    pub nature: u32,
    pub reserved: u32,
    pub size_pages: u64,
}

const_assert_eq!(core::mem::size_of::<MemObjCtlInfo>(), 24);

impl MemObjCtlInfo {
    pub fn to_le_bytes(&self) -> [u8; 24] {
        let mut bytes = [0u8; 24];
        bytes[0..4].copy_from_slice(&self.id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.nature.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.size_pages.to_le_bytes());
        bytes
    }
}

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct CreateArgsTyped {
    nature: Nature,
    flags: MemObjFlags,
    size_pages: u64,
    port: Option<PortId>,
    out: u64,
    tag: u64,
}

impl CreateArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let raw_nature = u32::try_from(args.get(0)).map_err(|_| VmError::InvalidArgs)?;
        let nature = Nature::from_raw(raw_nature).ok_or(VmError::InvalidArgs)?;
        let raw_flags = u32::try_from(args.get(1)).map_err(|_| VmError::InvalidArgs)?;
        let flags = MemObjFlags::from_bits(raw_flags).ok_or(VmError::InvalidArgs)?;
        let size = args.get(2) as u64;
        if size % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgs.into());
        }
        let port = match args.get(3) {
            0 => None,
            raw => Some(PortId::from_raw(u32::try_from(raw).map_err(|_| VmError::InvalidArgs)?)),
        };
        Ok(Self {
            nature,
            flags,
            size_pages: size / PAGE_SIZE as u64,
            port,
            out: args.get(4) as u64,
            tag: args.get(5) as u64,
        })
    }

    #[inline]
    fn check(&mut self) -> Result<(), Error> {
        if self.nature == Nature::Generic || self.flags.contains(MemObjFlags::IMMORTAL) {
            return Err(VmError::PermissionDenied.into());
        }
        if self.size_pages == 0 {
            return Err(VmError::InvalidArgs.into());
        }
        if (self.nature == Nature::Proxy) != self.port.is_some() {
            return Err(VmError::InvalidArgs.into());
        }
        self.flags.remove(MemObjFlags::KERNEL_OWNED);
        if !self.flags.intersects(MemObjFlags::LIFETIME) {
            self.flags.insert(MemObjFlags::EPHEMERAL);
        }
        if !self.flags.has_single_lifetime() {
            return Err(VmError::InvalidArgs.into());
        }
        if self.nature == Nature::Proxy {
            self.flags.insert(MemObjFlags::SHARED);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct CtlArgsTyped {
    id: MemObjId,
    cmd: usize,
    arg0: usize,
}

impl CtlArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let id = u32::try_from(args.get(0)).map_err(|_| VmError::InvalidArgs)?;
        Ok(Self { id: MemObjId::from_raw(id), cmd: args.get(1), arg0: args.get(2) })
    }
}

/// Registers the memory-object handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_MEMOBJ_CREATE, sys_memobj_create);
    table.register(SYSCALL_MEMOBJ_CTL, sys_memobj_ctl);
}

fn sys_memobj_create(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let mut typed = CreateArgsTyped::decode(args)?;
    typed.check()?;

    let backend = match typed.port {
        Some(port) => {
            let (server, channel) = ctx.caller.resolve_port(port).ok_or(VmError::InvalidArgs)?;
            Some(Backend::new(server, channel, typed.tag))
        }
        None => None,
    };
    let obj = registry().create(typed.nature, typed.size_pages, typed.flags, backend)?;
    let info = MemObjInfo { id: obj.id().as_raw(), flags: obj.flags().bits() };
    if let Err(err) = ctx.caller.copy_to_user(typed.out, &info.to_le_bytes()) {
        registry().discard(obj);
        return Err(err.into());
    }
    log::debug!(target: "syscall", "memobj create id {} flags {:#x}", info.id, info.flags);
    ctx.caller.adopt_memobj(obj);
    Ok(0)
}

fn sys_memobj_ctl(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = CtlArgsTyped::decode(args)?;
    let obj = registry().lookup(typed.id).ok_or(VmError::InvalidArgs)?;
    match typed.cmd {
        MEMOBJ_CTL_GET_INFO => {
            let info = MemObjCtlInfo {
                id: obj.id().as_raw(),
                flags: obj.flags().bits(),
                nature: obj.nature().as_raw(),
                reserved: 0,
                size_pages: obj.size_pages(),
            };
            ctx.caller.copy_to_user(typed.arg0 as u64, &info.to_le_bytes())?;
            Ok(0)
        }
        MEMOBJ_CTL_TRUNCATE => {
            let size = typed.arg0 as u64;
            if size % PAGE_SIZE as u64 != 0 {
                return Err(VmError::InvalidArgs.into());
            }
            obj.truncate(size / PAGE_SIZE as u64)?;
            Ok(0)
        }
        MEMOBJ_CTL_CHANGE_INFO
        | MEMOBJ_CTL_SET_BACKEND
        | MEMOBJ_CTL_GET_BACKEND
        | MEMOBJ_CTL_PUT_PAGE => Err(VmError::NotSupported.into()),
        _ => Err(VmError::InvalidArgs.into()),
    }
}
