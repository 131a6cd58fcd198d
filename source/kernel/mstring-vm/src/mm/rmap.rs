// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reverse-mapping contract: which (address space, address) pairs map a frame.

use crate::error::VmResult;
use crate::types::{AsId, MemObjId, PageIndex, VirtAddr};

/// Reverse map maintained alongside every user mapping.
///
/// Anonymous frames have a single owner. Shared frames are tracked per memory
/// object and may have many.
pub trait ReverseMap: Send + Sync {
    /// Records the sole owner of an anonymous frame.
    fn register_anon(&self, frame: PageIndex, space: AsId, va: VirtAddr) -> VmResult<()>;

    /// Adds a mapping of a frame shared through `memobj`.
    fn register_shared(
        &self,
        frame: PageIndex,
        space: AsId,
        va: VirtAddr,
        memobj: MemObjId,
    ) -> VmResult<()>;

    /// Forgets the mapping of `frame` at (`space`, `va`).
    fn unregister(&self, frame: PageIndex, space: AsId, va: VirtAddr);

    /// Converts the anonymous tracking of `frame` into shared tracking under `memobj`.
    fn anon_to_shared(&self, frame: PageIndex, memobj: MemObjId) -> VmResult<()>;
}
