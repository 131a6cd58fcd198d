// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Generic nature: anonymous, zero-filled RAM.

use super::{MemObjOps, MemObject};
use crate::error::{VmError, VmResult};
use crate::fault::{self, Fault, FaultMask, FaultState};
use crate::mm::{AddressSpace, PageAttrs, VmRange};
use crate::types::{PageIndex, VirtAddr};

pub(super) struct GenericOps;

impl MemObjOps for GenericOps {
    fn handle_page_fault(&self, _obj: &MemObject, fault: &Fault<'_>) -> VmResult<()> {
        match fault.state() {
            FaultState::NotPresent => fault::resolve_anon_not_present(fault),
            FaultState::ProtectionOnly => fault::resolve_anon_protection(fault),
        }
    }

    fn insert_page(
        &self,
        _obj: &MemObject,
        space: &AddressSpace,
        va: VirtAddr,
        frame: PageIndex,
        attrs: PageAttrs,
    ) -> VmResult<()> {
        let mut table = space.lock_table();
        if table.translate(va).is_some() {
            return Err(VmError::Busy);
        }
        table.map_one(va, frame, attrs)?;
        if let Err(err) = space.rmap().register_anon(frame, space.id(), va) {
            // The frame stays with the caller.
            table.unmap(va, 1, false)?;
            space.frames().frame(frame).unpin();
            return Err(err);
        }
        Ok(())
    }

    fn delete_page(&self, _obj: &MemObject, space: &AddressSpace, va: VirtAddr) -> VmResult<()> {
        let mut table = space.lock_table();
        let frame = table.translate(va).ok_or(VmError::Fault)?;
        space.rmap().unregister(frame, space.id(), va);
        table.unmap(va, 1, true)
    }

    fn populate_pages(
        &self,
        _obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        let mask = if range.attrs.contains(PageAttrs::WRITE) {
            FaultMask::WRITE
        } else {
            FaultMask::empty()
        };
        for index in 0..pages {
            let page = va.checked_add_pages(index).ok_or(VmError::InvalidArgs)?;
            if !range.contains(page) {
                return Err(VmError::InvalidArgs);
            }
            if space.translate(page).is_some() {
                continue;
            }
            fault::resolve_anon_not_present(&Fault::new(space, range, page, mask))?;
        }
        Ok(())
    }

    fn depopulate_pages(
        &self,
        _obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        let mut table = space.lock_table();
        for index in 0..pages {
            let page = va.checked_add_pages(index).ok_or(VmError::InvalidArgs)?;
            if !range.contains(page) {
                return Err(VmError::InvalidArgs);
            }
            let Some(frame) = table.translate(page) else {
                continue;
            };
            space.rmap().unregister(frame, space.id(), page);
            table.unmap(page, 1, true)?;
        }
        Ok(())
    }

    fn mmap_check(&self, _obj: &MemObject, _offset: u64, _pages: u64) -> VmResult<()> {
        Ok(())
    }

    fn cleanup(&self, _obj: &MemObject) -> VmResult<()> {
        Ok(())
    }
}
