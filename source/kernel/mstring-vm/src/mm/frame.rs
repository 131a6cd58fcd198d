// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frame descriptors and the allocator contract consumed by the VM core.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use super::pde::Pde;
use crate::types::PageIndex;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// State bits kept in a frame descriptor.
    pub struct FrameFlags: u32 {
        /// Frame is not managed by the allocator (firmware, MMIO, kernel image).
        const RESERVED = 1 << 0;
        /// Frame is tracked by a shared reverse mapping.
        const SHARED = 1 << 1;
        /// Writers must copy the frame before modifying it.
        const COW = 1 << 2;
    }
}

/// Per-frame descriptor.
///
/// The pin count tracks every page-table entry, directory slot and transient
/// kernel reference that keeps the frame alive.
#[derive(Debug, Default)]
pub struct PageFrame {
    refcount: AtomicUsize,
    flags: AtomicU32,
    offset: AtomicU64,
}

impl PageFrame {
    pub const fn new() -> Self {
        Self { refcount: AtomicUsize::new(0), flags: AtomicU32::new(0), offset: AtomicU64::new(0) }
    }

    /// Takes one pin and returns the new count.
    #[inline]
    pub fn pin(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one pin and returns the remaining count.
    #[inline]
    pub fn unpin(&self) -> usize {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "frame refcount underflow");
        prev - 1
    }

    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_flags(&self, flags: FrameFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flags(&self, flags: FrameFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Page offset of this frame inside the memory object that owns it.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    /// Resets the descriptor when the frame returns to the allocator.
    pub fn reset(&self) {
        self.flags.store(0, Ordering::Release);
        self.offset.store(0, Ordering::Release);
    }
}

/// Physical frame allocator together with access to frame contents.
///
/// Directory contents are reached through `read_pde`/`write_pde` so the walker
/// never forms raw pointers into physical memory itself.
pub trait FramePool: Send + Sync {
    /// Allocates a zero-filled frame with a pin count of zero.
    fn alloc_frame(&self) -> Option<PageIndex>;

    /// Returns an unpinned frame to the allocator.
    fn free_frame(&self, index: PageIndex);

    /// Descriptor of `index`.
    fn frame(&self, index: PageIndex) -> &PageFrame;

    /// Reads entry `slot` of the directory stored in frame `dir`.
    fn read_pde(&self, dir: PageIndex, slot: usize) -> Pde;

    /// Writes entry `slot` of the directory stored in frame `dir`.
    fn write_pde(&self, dir: PageIndex, slot: usize, pde: Pde);

    /// Copies the full contents of `src` into `dst`.
    fn copy_frame(&self, dst: PageIndex, src: PageIndex);

    /// Frames currently available for allocation.
    fn free_count(&self) -> usize;

    /// Drops one pin and frees the frame when none remain.
    fn put_frame(&self, index: PageIndex) {
        if self.frame(index).unpin() == 0 {
            self.free_frame(index);
        }
    }
}
