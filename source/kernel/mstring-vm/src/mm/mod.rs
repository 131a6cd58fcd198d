// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management core (frames, PDEs, 4-level page tables, address spaces)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageTable, AddressSpace, Pde, PageAttrs, FramePool, VmRange, ReverseMap
//! DEPENDS_ON: arch::x86_64 (TLB), diag, error
//! INVARIANTS: Present PDE <=> target frame pinned; directory pin count == present entries

pub mod address_space;
pub mod frame;
pub mod page_table;
pub mod pde;
pub mod range;
pub mod rmap;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

pub use address_space::AddressSpace;
pub use frame::{FrameFlags, FramePool, PageFrame};
pub use page_table::{PageTable, PtVerifyError, VPN_LIMIT};
pub use pde::{PageAttrs, Pde, PdeFlags};
pub use range::{RangeLookup, VmRange};
pub use rmap::ReverseMap;

#[cfg(test)]
mod tests_prop;
