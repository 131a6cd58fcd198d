// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the VM core (addresses, frame indices, object ids)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PageIndex, MemObjId, AsId, TaskId, PortId
//! DEPENDS_ON: mm::{PAGE_SIZE, PAGE_SHIFT}
//! INVARIANTS: VirtAddr is always canonical (48-bit, sign extended); page numbers are 36 bits

use core::fmt;

use crate::mm::{PAGE_SHIFT, PAGE_SIZE};

/// Number of implemented virtual address bits on 4-level x86_64.
const VA_BITS: u32 = 48;
const VA_MASK: u64 = (1 << VA_BITS) - 1;

/// Canonical x86_64 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Returns `Some` when `addr` is canonical.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns `Some` when `addr` is canonical and page aligned.
    #[inline]
    pub const fn page_aligned(addr: u64) -> Option<Self> {
        if addr % PAGE_SIZE as u64 != 0 {
            return None;
        }
        Self::new(addr)
    }

    /// Builds the canonical address of virtual page number `vpn`.
    #[inline]
    pub const fn from_vpn(vpn: u64) -> Self {
        Self(sign_extend((vpn << PAGE_SHIFT) & VA_MASK))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Virtual page number (bits 12..48).
    #[inline]
    pub const fn vpn(self) -> u64 {
        (self.0 & VA_MASK) >> PAGE_SHIFT
    }

    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Address `pages` pages above `self`, if it stays canonical and contiguous.
    #[inline]
    pub fn checked_add_pages(self, pages: u64) -> Option<Self> {
        let bytes = pages.checked_mul(PAGE_SIZE as u64)?;
        let addr = self.0.checked_add(bytes)?;
        Self::new(addr)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Returns `true` when bits 48..64 replicate bit 47.
#[inline]
pub const fn is_canonical(addr: u64) -> bool {
    sign_extend(addr & VA_MASK) == addr
}

const fn sign_extend(addr: u64) -> u64 {
    if addr & (1 << (VA_BITS - 1)) != 0 {
        addr | !VA_MASK
    } else {
        addr
    }
}

/// Physical page frame number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageIndex(u64);

impl PageIndex {
    /// Largest frame number a PDE can encode (40 bits).
    pub const MAX: u64 = (1 << 40) - 1;

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

/// Memory object identifier.
///
/// **Ownership**: only `MemObjRegistry` allocates and releases ids.
/// **Invariant**: id 0 is never handed out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MemObjId(u32);

impl MemObjId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MemObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address space identifier, assigned by the task layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AsId(u32);

impl AsId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identifier of a pager server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskId(u32);

impl TaskId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// IPC port identifier passed by userspace when attaching a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PortId(u32);

impl PortId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}
