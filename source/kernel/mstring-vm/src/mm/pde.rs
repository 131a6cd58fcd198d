// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: x86_64 page directory entry encoding and page attribute translation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Pde, PdeFlags, PageAttrs
//! INVARIANTS: 8-byte entries; frame index is 40 bits split in two 20-bit fields

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::types::PageIndex;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Hardware flag bits of a PDE.
    pub struct PdeFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const NO_EXECUTE = 1 << 63;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Architecture-neutral protection and caching attributes of a mapping.
    pub struct PageAttrs: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const NOCACHE = 1 << 4;
        const WRITETHROUGH = 1 << 5;
    }
}

const PFN_LO_SHIFT: u32 = 12;
const PFN_HI_SHIFT: u32 = 32;
const PFN_FIELD_BITS: u32 = 20;
const PFN_FIELD_MASK: u64 = (1 << PFN_FIELD_BITS) - 1;

/// Flags of non-leaf entries; leaves narrow the effective rights.
const DIRECTORY_FLAGS: PdeFlags =
    PdeFlags::PRESENT.union(PdeFlags::WRITABLE).union(PdeFlags::USER);

const ATTR_COMBINATIONS: usize = 1 << 6;

const fn leaf_flags(attrs: u32) -> PdeFlags {
    let mut flags = PdeFlags::PRESENT;
    if attrs & PageAttrs::WRITE.bits() != 0 {
        flags = flags.union(PdeFlags::WRITABLE);
    }
    if attrs & PageAttrs::USER.bits() != 0 {
        flags = flags.union(PdeFlags::USER);
    }
    if attrs & PageAttrs::NOCACHE.bits() != 0 {
        flags = flags.union(PdeFlags::CACHE_DISABLE);
    }
    if attrs & PageAttrs::WRITETHROUGH.bits() != 0 {
        flags = flags.union(PdeFlags::WRITE_THROUGH);
    }
    if attrs & PageAttrs::EXEC.bits() == 0 {
        flags = flags.union(PdeFlags::NO_EXECUTE);
    }
    flags
}

const fn build_leaf_table() -> [PdeFlags; ATTR_COMBINATIONS] {
    let mut table = [PdeFlags::empty(); ATTR_COMBINATIONS];
    let mut index = 0;
    while index < ATTR_COMBINATIONS {
        table[index] = leaf_flags(index as u32);
        index += 1;
    }
    table
}

/// Leaf PDE flags indexed by `PageAttrs` bits.
static LEAF_FLAGS: [PdeFlags; ATTR_COMBINATIONS] = build_leaf_table();

/// One 8-byte entry of any of the four paging levels.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pde(u64);

const_assert_eq!(core::mem::size_of::<Pde>(), 8);

impl Pde {
    /// Non-present entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Leaf entry mapping `frame` with `attrs`.
    #[inline]
    pub fn leaf(frame: PageIndex, attrs: PageAttrs) -> Self {
        Self::with_frame(frame, LEAF_FLAGS[(attrs & PageAttrs::all()).bits() as usize])
    }

    /// Non-leaf entry pointing at the directory stored in `frame`.
    #[inline]
    pub fn directory(frame: PageIndex) -> Self {
        Self::with_frame(frame, DIRECTORY_FLAGS)
    }

    fn with_frame(frame: PageIndex, flags: PdeFlags) -> Self {
        debug_assert!(frame.as_raw() <= PageIndex::MAX);
        let pfn = frame.as_raw();
        let lo = pfn & PFN_FIELD_MASK;
        let hi = (pfn >> PFN_FIELD_BITS) & PFN_FIELD_MASK;
        Self(flags.bits() | (lo << PFN_LO_SHIFT) | (hi << PFN_HI_SHIFT))
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PdeFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & PdeFlags::WRITABLE.bits() != 0
    }

    #[inline]
    pub const fn flags(self) -> PdeFlags {
        PdeFlags::from_bits_truncate(self.0)
    }

    /// Frame index stored in the entry.
    #[inline]
    pub const fn frame(self) -> PageIndex {
        let lo = (self.0 >> PFN_LO_SHIFT) & PFN_FIELD_MASK;
        let hi = (self.0 >> PFN_HI_SHIFT) & PFN_FIELD_MASK;
        PageIndex::from_raw(lo | (hi << PFN_FIELD_BITS))
    }
}

impl fmt::Debug for Pde {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_present() {
            write!(f, "Pde({} {:?})", self.frame(), self.flags())
        } else {
            f.write_str("Pde(empty)")
        }
    }
}
