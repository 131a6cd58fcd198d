// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: 4-level x86_64 page-table walker with transactional map and rollback
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageTable::{new, map, map_one, unmap, translate, entry, verify}
//! DEPENDS_ON: mm::frame::FramePool, mm::pde, arch::x86_64::flush_tlb_entry
//! INVARIANTS:
//!   - Directory pin count == number of present entries (root carries one extra owner pin)
//!   - Every present leaf holds exactly one pin on its frame
//!   - A failed map leaves the tree and the frame pool exactly as before

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use super::frame::FramePool;
use super::pde::{PageAttrs, Pde};
use crate::arch::x86_64::flush_tlb_entry;
use crate::error::{VmError, VmResult};
use crate::types::{PageIndex, VirtAddr};

/// Number of paging levels; level 1 holds leaves.
const LEVELS: usize = 4;
/// Entries per directory.
pub const ENTRIES: usize = 512;
const INDEX_BITS: u32 = 9;
/// Pages addressable by one root directory.
pub const VPN_LIMIT: u64 = 1 << (INDEX_BITS * LEVELS as u32);

/// Pages covered by a single entry of a level-`level` directory.
#[inline]
const fn span(level: usize) -> u64 {
    1 << (INDEX_BITS * (level as u32 - 1))
}

#[inline]
const fn slot_index(vpn: u64, level: usize) -> usize {
    ((vpn >> (INDEX_BITS * (level as u32 - 1))) & (ENTRIES as u64 - 1)) as usize
}

/// Directory whose pin count disagrees with its present entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtVerifyError {
    pub dir: PageIndex,
    pub level: usize,
    pub expected: usize,
    pub found: usize,
}

impl fmt::Display for PtVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dir {} level {} refcount {} expected {}",
            self.dir, self.level, self.found, self.expected
        )
    }
}

enum LogEntry {
    NewDir { parent: PageIndex, slot: usize, dir: PageIndex },
    Leaf { dir: PageIndex, slot: usize, va: VirtAddr, prev: Pde, frame: PageIndex, pinned: bool },
}

/// Structural edits of one `map` call, undone in reverse on failure.
struct MapLog {
    entries: Vec<LogEntry>,
}

impl MapLog {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Reserves room for the next entry so recording never allocates.
    fn reserve(&mut self) -> VmResult<()> {
        self.entries.try_reserve(1).map_err(|_| VmError::OutOfMemory)
    }

    fn record(&mut self, entry: LogEntry) {
        debug_assert!(self.entries.len() < self.entries.capacity());
        self.entries.push(entry);
    }
}

/// Page table rooted at a single top-level directory frame.
pub struct PageTable {
    root: PageIndex,
    frames: Arc<dyn FramePool>,
}

impl PageTable {
    /// Allocates an empty root directory.
    pub fn new(frames: Arc<dyn FramePool>) -> VmResult<Self> {
        let root = frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        frames.frame(root).pin();
        Ok(Self { root, frames })
    }

    /// Frame holding the top-level directory (CR3 value >> 12).
    pub fn root(&self) -> PageIndex {
        self.root
    }

    /// Maps `page_count` pages starting at `va`, pulling one frame per page from `frames`.
    ///
    /// Either every page is mapped or nothing changes. Each installed frame
    /// gains one pin; a different frame displaced from a slot loses one pin
    /// once the whole call has succeeded.
    pub fn map(
        &mut self,
        va: VirtAddr,
        page_count: u64,
        frames: &mut dyn Iterator<Item = PageIndex>,
        attrs: PageAttrs,
    ) -> VmResult<()> {
        let vpn = check_range(va, page_count)?;
        if page_count == 0 {
            return Ok(());
        }
        let mut log = MapLog::new();
        match self.map_level(self.root, LEVELS, vpn, page_count, frames, attrs, &mut log) {
            Ok(()) => {
                self.commit(log);
                self.post_edit_check();
                Ok(())
            }
            Err(err) => {
                log::debug!(
                    target: "pt",
                    "map {} x{} failed ({}), rolling back",
                    va,
                    page_count,
                    err
                );
                self.rollback(log);
                self.post_edit_check();
                Err(err)
            }
        }
    }

    /// Maps a single page.
    pub fn map_one(&mut self, va: VirtAddr, frame: PageIndex, attrs: PageAttrs) -> VmResult<()> {
        self.map(va, 1, &mut core::iter::once(frame), attrs)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_level(
        &self,
        dir: PageIndex,
        level: usize,
        start: u64,
        count: u64,
        frames: &mut dyn Iterator<Item = PageIndex>,
        attrs: PageAttrs,
        log: &mut MapLog,
    ) -> VmResult<()> {
        let end = start + count;
        let mut vpn = start;
        while vpn < end {
            let slot = slot_index(vpn, level);
            let chunk_end = core::cmp::min(end, (vpn / span(level) + 1) * span(level));
            if level == 1 {
                let frame = frames.next().ok_or(VmError::InvalidArgs)?;
                if frame.as_raw() > PageIndex::MAX {
                    return Err(VmError::InvalidArgs);
                }
                self.write_leaf(dir, slot, VirtAddr::from_vpn(vpn), frame, attrs, log)?;
            } else {
                let child = self.ensure_dir(dir, slot, log)?;
                self.map_level(child, level - 1, vpn, chunk_end - vpn, frames, attrs, log)?;
            }
            vpn = chunk_end;
        }
        Ok(())
    }

    fn ensure_dir(&self, dir: PageIndex, slot: usize, log: &mut MapLog) -> VmResult<PageIndex> {
        let entry = self.frames.read_pde(dir, slot);
        if entry.is_present() {
            return Ok(entry.frame());
        }
        log.reserve()?;
        let child = self.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        self.frames.write_pde(dir, slot, Pde::directory(child));
        self.frames.frame(dir).pin();
        log.record(LogEntry::NewDir { parent: dir, slot, dir: child });
        Ok(child)
    }

    fn write_leaf(
        &self,
        dir: PageIndex,
        slot: usize,
        va: VirtAddr,
        frame: PageIndex,
        attrs: PageAttrs,
        log: &mut MapLog,
    ) -> VmResult<()> {
        log.reserve()?;
        let prev = self.frames.read_pde(dir, slot);
        let same_frame = prev.is_present() && prev.frame() == frame;
        if !same_frame {
            self.frames.frame(frame).pin();
            if !prev.is_present() {
                self.frames.frame(dir).pin();
            }
        }
        self.frames.write_pde(dir, slot, Pde::leaf(frame, attrs));
        if prev.is_present() {
            flush_tlb_entry(va);
        }
        log.record(LogEntry::Leaf { dir, slot, va, prev, frame, pinned: !same_frame });
        Ok(())
    }

    fn commit(&self, log: MapLog) {
        for entry in log.entries {
            if let LogEntry::Leaf { prev, pinned: true, .. } = entry {
                if prev.is_present() {
                    self.frames.put_frame(prev.frame());
                }
            }
        }
    }

    fn rollback(&self, log: MapLog) {
        for entry in log.entries.into_iter().rev() {
            match entry {
                LogEntry::Leaf { dir, slot, va, prev, frame, pinned } => {
                    self.frames.write_pde(dir, slot, prev);
                    flush_tlb_entry(va);
                    if pinned {
                        // The caller still owns the frame; only our pin goes away.
                        self.frames.frame(frame).unpin();
                        if !prev.is_present() {
                            self.frames.frame(dir).unpin();
                        }
                    }
                }
                LogEntry::NewDir { parent, slot, dir } => {
                    debug_assert_eq!(self.frames.frame(dir).refcount(), 0);
                    self.frames.write_pde(parent, slot, Pde::EMPTY);
                    self.frames.frame(parent).unpin();
                    self.frames.free_frame(dir);
                }
            }
        }
    }

    /// Removes `page_count` mappings starting at `va`.
    ///
    /// With `unpin_pages` each leaf frame loses its pin (and is freed at zero);
    /// otherwise the caller takes over that pin. Directories left empty are freed.
    ///
    /// # Panics
    /// Panics if any page in the range is not mapped.
    pub fn unmap(&mut self, va: VirtAddr, page_count: u64, unpin_pages: bool) -> VmResult<()> {
        let vpn = check_range(va, page_count)?;
        if page_count == 0 {
            return Ok(());
        }
        self.unmap_level(self.root, LEVELS, vpn, page_count, unpin_pages);
        self.post_edit_check();
        Ok(())
    }

    fn unmap_level(&self, dir: PageIndex, level: usize, start: u64, count: u64, unpin_pages: bool) {
        let end = start + count;
        let mut vpn = start;
        while vpn < end {
            let slot = slot_index(vpn, level);
            let chunk_end = core::cmp::min(end, (vpn / span(level) + 1) * span(level));
            let entry = self.frames.read_pde(dir, slot);
            let va = VirtAddr::from_vpn(vpn);
            assert!(entry.is_present(), "unmap of non-present page at {}", va);
            if level == 1 {
                self.frames.write_pde(dir, slot, Pde::EMPTY);
                flush_tlb_entry(va);
                self.frames.frame(dir).unpin();
                if unpin_pages {
                    self.frames.put_frame(entry.frame());
                }
            } else {
                let child = entry.frame();
                self.unmap_level(child, level - 1, vpn, chunk_end - vpn, unpin_pages);
                if self.frames.frame(child).refcount() == 0 {
                    self.frames.write_pde(dir, slot, Pde::EMPTY);
                    self.frames.frame(dir).unpin();
                    self.frames.free_frame(child);
                }
            }
            vpn = chunk_end;
        }
    }

    /// Frame mapped at `va`, if any.
    pub fn translate(&self, va: VirtAddr) -> Option<PageIndex> {
        self.entry(va).map(Pde::frame)
    }

    /// Copy of the present leaf entry mapping `va`.
    pub fn entry(&self, va: VirtAddr) -> Option<Pde> {
        let vpn = va.vpn();
        let mut dir = self.root;
        for level in (1..=LEVELS).rev() {
            let entry = self.frames.read_pde(dir, slot_index(vpn, level));
            if !entry.is_present() {
                return None;
            }
            if level == 1 {
                return Some(entry);
            }
            dir = entry.frame();
        }
        None
    }

    /// Checks the directory pin-count invariant over the whole tree.
    pub fn verify(&self) -> Result<(), PtVerifyError> {
        self.verify_dir(self.root, LEVELS, 1)
    }

    fn verify_dir(&self, dir: PageIndex, level: usize, extra: usize) -> Result<(), PtVerifyError> {
        let mut present = 0;
        for slot in 0..ENTRIES {
            let entry = self.frames.read_pde(dir, slot);
            if !entry.is_present() {
                continue;
            }
            present += 1;
            if level > 1 {
                self.verify_dir(entry.frame(), level - 1, 0)?;
            }
        }
        let found = self.frames.frame(dir).refcount();
        if found != present + extra {
            return Err(PtVerifyError { dir, level, expected: present + extra, found });
        }
        Ok(())
    }

    #[inline]
    fn post_edit_check(&self) {
        #[cfg(any(test, feature = "debug_pt_verify"))]
        {
            if let Err(err) = self.verify() {
                log::error!(target: "pt", "PT-VERIFY: {}", err);
            }
        }
    }

    /// Clears every entry below `dir`, returning the number of leaves released.
    fn teardown(&self, dir: PageIndex, level: usize) -> usize {
        let mut leaves = 0;
        for slot in 0..ENTRIES {
            let entry = self.frames.read_pde(dir, slot);
            if !entry.is_present() {
                continue;
            }
            if level > 1 {
                leaves += self.teardown(entry.frame(), level - 1);
                self.frames.free_frame(entry.frame());
            } else {
                self.frames.put_frame(entry.frame());
                leaves += 1;
            }
            self.frames.write_pde(dir, slot, Pde::EMPTY);
            self.frames.frame(dir).unpin();
        }
        leaves
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        let leaves = self.teardown(self.root, LEVELS);
        if leaves != 0 {
            log::warn!(target: "pt", "dropping table {} with {} live mappings", self.root, leaves);
        }
        self.frames.put_frame(self.root);
    }
}

/// Validates `[va, va + page_count)` and returns the first page number.
fn check_range(va: VirtAddr, page_count: u64) -> VmResult<u64> {
    if !va.is_page_aligned() {
        return Err(VmError::InvalidArgs);
    }
    if page_count > 0 {
        // The last page must stay canonical and inside the root span.
        va.checked_add_pages(page_count - 1).ok_or(VmError::InvalidArgs)?;
        if va.vpn() + page_count > VPN_LIMIT {
            return Err(VmError::InvalidArgs);
        }
    }
    Ok(va.vpn())
}
