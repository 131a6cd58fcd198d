// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address space: a root page table behind its lock plus the collaborators
//! every fault path needs.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use super::frame::FramePool;
use super::page_table::PageTable;
use super::rmap::ReverseMap;
use crate::error::VmResult;
use crate::types::{AsId, PageIndex, VirtAddr};

/// Per-task view of virtual memory.
///
/// **Locking**: the table mutex is held for each whole map/unmap walk and is
/// never held across an IPC round-trip. When two spaces are locked together
/// (fork) the parent is locked first.
pub struct AddressSpace {
    id: AsId,
    table: Mutex<PageTable>,
    frames: Arc<dyn FramePool>,
    rmap: Arc<dyn ReverseMap>,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh root directory.
    pub fn new(id: AsId, frames: Arc<dyn FramePool>, rmap: Arc<dyn ReverseMap>) -> VmResult<Self> {
        let table = PageTable::new(Arc::clone(&frames))?;
        log::debug!(target: "pt", "address space {} root {}", id, table.root());
        Ok(Self { id, table: Mutex::new(table), frames, rmap })
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    /// Locks the page table for a structural edit.
    pub fn lock_table(&self) -> MutexGuard<'_, PageTable> {
        self.table.lock()
    }

    /// Frame mapped at `va`, taken under the table lock.
    pub fn translate(&self, va: VirtAddr) -> Option<PageIndex> {
        self.table.lock().translate(va)
    }

    pub fn frames(&self) -> &dyn FramePool {
        &*self.frames
    }

    pub fn rmap(&self) -> &dyn ReverseMap {
        &*self.rmap
    }
}
