// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolution (demand zero, write grant, copy-on-write)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: resolve(), handle_user_fault(), Fault, FaultMask, FaultDisposition, cow::*
//! DEPENDS_ON: mm::{AddressSpace, VmRange}, memobj, diag::stats
//! INVARIANTS:
//!   - A fault is resolved by the memory object backing the faulting range
//!   - A first read touch of anonymous memory installs the page read-only
//!   - Losing a race against a concurrent resolver is success, not an error

pub mod cow;

use bitflags::bitflags;

use crate::diag::stats::{bump, stats};
use crate::error::{VmError, VmResult};
use crate::mm::{AddressSpace, FrameFlags, PageAttrs, RangeLookup, VmRange};
use crate::types::VirtAddr;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// x86 page-fault error code bits.
    pub struct FaultMask: u32 {
        /// The faulting entry was present (protection violation).
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// Access came from user mode.
        const USER = 1 << 2;
        /// Instruction fetch.
        const EXEC = 1 << 4;
    }
}

/// Kind of fault, derived from [`FaultMask::PRESENT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultState {
    NotPresent,
    ProtectionOnly,
}

/// A fault being resolved against one VM range.
pub struct Fault<'a> {
    pub space: &'a AddressSpace,
    pub range: &'a VmRange,
    pub addr: VirtAddr,
    pub mask: FaultMask,
}

impl<'a> Fault<'a> {
    pub fn new(
        space: &'a AddressSpace,
        range: &'a VmRange,
        addr: VirtAddr,
        mask: FaultMask,
    ) -> Self {
        Self { space, range, addr, mask }
    }

    pub fn state(&self) -> FaultState {
        if self.mask.contains(FaultMask::PRESENT) {
            FaultState::ProtectionOnly
        } else {
            FaultState::NotPresent
        }
    }

    /// Page-aligned faulting address.
    pub fn page(&self) -> VirtAddr {
        self.addr.align_down()
    }

    /// Object page offset of the faulting page.
    pub fn offset(&self) -> u64 {
        self.range.object_offset(self.addr)
    }

    pub fn is_write(&self) -> bool {
        self.mask.contains(FaultMask::WRITE)
    }
}

/// Resolves a fault at `addr` inside `range` of `space`.
pub fn resolve(
    space: &AddressSpace,
    range: &VmRange,
    addr: VirtAddr,
    mask: FaultMask,
) -> VmResult<()> {
    if !range.contains(addr) {
        return Err(VmError::Fault);
    }
    if mask.contains(FaultMask::WRITE) && !range.attrs.contains(PageAttrs::WRITE) {
        return Err(VmError::Fault);
    }
    if mask.contains(FaultMask::EXEC) && !range.attrs.contains(PageAttrs::EXEC) {
        return Err(VmError::Fault);
    }
    bump(&stats().faults);
    let fault = Fault::new(space, range, addr, mask);
    log::trace!(
        target: "fault",
        "as {} addr {} mask {:?} obj {}",
        space.id(),
        addr,
        mask,
        range.memobj.id()
    );
    range.memobj.handle_page_fault(&fault).inspect_err(|err| {
        bump(&stats().failures);
        log::debug!(target: "fault", "as {} addr {} unresolved: {}", space.id(), addr, err);
    })
}

/// Signal delivered to a task whose fault could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Segv,
    Bus,
}

/// Outcome of a trapped page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Return to the faulting instruction.
    Resolved,
    /// Deliver a signal to the faulting task.
    Signal(Signal),
    /// Kernel-mode fault that could not be resolved.
    Fatal,
}

/// Trap entry: finds the range covering `addr` and resolves the fault.
pub fn handle_user_fault(
    space: &AddressSpace,
    ranges: &dyn RangeLookup,
    addr: u64,
    mask: FaultMask,
) -> FaultDisposition {
    let result = VirtAddr::new(addr)
        .ok_or(VmError::Fault)
        .and_then(|va| {
            let range = ranges.find_range(va).ok_or(VmError::Fault)?;
            resolve(space, &range, va, mask)
        });
    let err = match result {
        Ok(()) => return FaultDisposition::Resolved,
        Err(err) => err,
    };
    if !mask.contains(FaultMask::USER) {
        log::error!(target: "fault", "kernel fault at {:#x} mask {:?}: {}", addr, mask, err);
        return FaultDisposition::Fatal;
    }
    let signal = match err {
        VmError::OutOfMemory => Signal::Kill,
        VmError::ProtocolFault(_) | VmError::Backend { .. } => Signal::Bus,
        _ => Signal::Segv,
    };
    log::info!(target: "fault", "as {} addr {:#x}: {} -> {:?}", space.id(), addr, err, signal);
    FaultDisposition::Signal(signal)
}

/// Demand-zero fill of an anonymous page.
pub(crate) fn resolve_anon_not_present(fault: &Fault<'_>) -> VmResult<()> {
    let space = fault.space;
    let frames = space.frames();
    let page = fault.page();
    let frame = frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
    frames.frame(frame).set_offset(fault.offset());

    let mut table = space.lock_table();
    if table.translate(page).is_some() {
        drop(table);
        frames.free_frame(frame);
        bump(&stats().races);
        return Ok(());
    }
    let attrs =
        if fault.is_write() { fault.range.attrs } else { fault.range.attrs - PageAttrs::WRITE };
    if let Err(err) = table.map_one(page, frame, attrs) {
        drop(table);
        frames.free_frame(frame);
        return Err(err);
    }
    if let Err(err) = space.rmap().register_anon(frame, space.id(), page) {
        table.unmap(page, 1, true)?;
        return Err(err);
    }
    bump(&stats().zero_fills);
    Ok(())
}

/// Protection fault on an anonymous page: grant write or break COW.
pub(crate) fn resolve_anon_protection(fault: &Fault<'_>) -> VmResult<()> {
    let space = fault.space;
    let page = fault.page();
    let mut table = space.lock_table();
    let Some(entry) = table.entry(page) else {
        drop(table);
        return resolve_anon_not_present(fault);
    };
    let frame = entry.frame();
    if !space.frames().frame(frame).flags().contains(FrameFlags::COW) {
        table.map_one(page, frame, fault.range.attrs)?;
        bump(&stats().write_grants);
        return Ok(());
    }
    cow::break_cow(fault, &mut table, frame)
}

#[cfg(test)]
mod tests;
