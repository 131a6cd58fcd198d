// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write: marking pages shared at fork and breaking the share on write.

use super::Fault;
use crate::diag::stats::{bump, stats};
use crate::error::{VmError, VmResult};
use crate::memobj::MemObjFlags;
use crate::mm::{AddressSpace, FrameFlags, FramePool, PageAttrs, PageTable, ReverseMap, VmRange};
use crate::types::{AsId, MemObjId, PageIndex, VirtAddr};

/// Prepares `frame` to be mapped copy-on-write by `child` at `va`.
///
/// A privately owned frame is converted to shared rmap tracking under
/// `memobj` and marked COW; the child's mapping is then registered.
pub fn prepare_page_for_cow(
    frames: &dyn FramePool,
    rmap: &dyn ReverseMap,
    frame: PageIndex,
    child: AsId,
    va: VirtAddr,
    memobj: MemObjId,
) -> VmResult<()> {
    let desc = frames.frame(frame);
    if !desc.flags().contains(FrameFlags::COW) && desc.refcount() == 1 {
        rmap.anon_to_shared(frame, memobj)?;
        desc.set_flags(FrameFlags::COW | FrameFlags::SHARED);
    }
    rmap.register_shared(frame, child, va, memobj)
}

/// Duplicates the present pages of `range` from `parent` into `child`.
///
/// Private ranges end up write-protected on both sides; ranges of SHARED
/// objects map the same frames with full attributes. On error the pages
/// handled so far stay shared and the caller tears the child down.
pub fn share_range_for_fork(
    parent: &AddressSpace,
    child: &AddressSpace,
    range: &VmRange,
) -> VmResult<()> {
    let frames = parent.frames();
    let rmap = parent.rmap();
    let memobj = range.memobj.id();
    let shared = range.memobj.flags().contains(MemObjFlags::SHARED);
    let readonly = range.attrs - PageAttrs::WRITE;

    let mut ptable = parent.lock_table();
    let mut ctable = child.lock_table();
    let mut copied = 0u64;
    for index in 0..range.pages {
        let va = range.page(index).ok_or(VmError::InvalidArgs)?;
        let Some(frame) = ptable.translate(va) else {
            continue;
        };
        if shared {
            ctable.map_one(va, frame, range.attrs)?;
            if let Err(err) = rmap.register_shared(frame, child.id(), va, memobj) {
                ctable.unmap(va, 1, true)?;
                return Err(err);
            }
        } else {
            prepare_page_for_cow(frames, rmap, frame, child.id(), va, memobj)?;
            let mapped = ptable
                .map_one(va, frame, readonly)
                .and_then(|()| ctable.map_one(va, frame, readonly));
            if let Err(err) = mapped {
                rmap.unregister(frame, child.id(), va);
                return Err(err);
            }
        }
        copied += 1;
    }
    log::debug!(
        target: "fault",
        "fork as {} -> {}: {} pages of {} {}",
        parent.id(),
        child.id(),
        copied,
        range.start,
        if shared { "shared" } else { "cow" }
    );
    Ok(())
}

/// Replaces the COW frame `old` mapped at the faulting page with a private copy.
pub(super) fn break_cow(
    fault: &Fault<'_>,
    table: &mut PageTable,
    old: PageIndex,
) -> VmResult<()> {
    let space = fault.space;
    let frames = space.frames();
    let rmap = space.rmap();
    let page = fault.page();

    let new = frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
    frames.copy_frame(new, old);
    frames.frame(new).set_offset(frames.frame(old).offset());
    if let Err(err) = rmap.register_anon(new, space.id(), page) {
        frames.free_frame(new);
        return Err(err);
    }
    // Keep `old` alive until its rmap entry is gone; the map commit drops
    // the page-table pin.
    frames.frame(old).pin();
    if let Err(err) = table.map_one(page, new, fault.range.attrs) {
        frames.frame(old).unpin();
        rmap.unregister(new, space.id(), page);
        frames.free_frame(new);
        return Err(err);
    }
    rmap.unregister(old, space.id(), page);
    frames.put_frame(old);
    bump(&stats().cow_copies);
    log::trace!(target: "fault", "cow as {} {} {} -> {}", space.id(), page, old, new);
    Ok(())
}
