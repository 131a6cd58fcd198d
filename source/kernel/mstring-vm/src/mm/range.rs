// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! VM range descriptor handed to the fault path by the range tracker.

use super::pde::PageAttrs;
use crate::memobj::MemObjRef;
use crate::types::VirtAddr;

/// Contiguous virtual range backed by one memory object.
///
/// Holding a `VmRange` pins its memory object.
#[derive(Clone, Debug)]
pub struct VmRange {
    pub start: VirtAddr,
    pub pages: u64,
    pub attrs: PageAttrs,
    pub memobj: MemObjRef,
    /// Object page offset of the first page.
    pub offset: u64,
}

impl VmRange {
    pub fn contains(&self, addr: VirtAddr) -> bool {
        let vpn = addr.vpn();
        vpn >= self.start.vpn() && vpn - self.start.vpn() < self.pages
    }

    /// Object page offset backing `addr`; `addr` must lie inside the range.
    pub fn object_offset(&self, addr: VirtAddr) -> u64 {
        debug_assert!(self.contains(addr));
        self.offset + (addr.vpn() - self.start.vpn())
    }

    /// Address of page `index` of the range.
    pub fn page(&self, index: u64) -> Option<VirtAddr> {
        if index >= self.pages {
            return None;
        }
        self.start.checked_add_pages(index)
    }
}

/// Lookup of the VM range covering an address.
pub trait RangeLookup {
    fn find_range(&self, addr: VirtAddr) -> Option<VmRange>;
}
