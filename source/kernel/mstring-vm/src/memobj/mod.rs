// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Polymorphic memory objects (generic anonymous RAM, page cache stub, proxy)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemObject, MemObjRef, MemObjOps, MemObjFlags, Nature, Backend, registry
//! DEPENDS_ON: mm, fault::Fault, ipc::Channel
//! INVARIANTS:
//!   - Exactly one lifetime flag (EPHEMERAL/STICKY/RECLAIM/IMMORTAL) per object
//!   - BACKENDED <=> backend present <=> nature is Proxy
//!   - Every public operation on an INACTIVE object fails with Canceled

pub mod generic;
pub mod page_cache;
pub mod proxy;
pub mod registry;

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::error::{VmError, VmResult};
use crate::fault::Fault;
use crate::ipc::Channel;
use crate::mm::{AddressSpace, PageAttrs, RangeLookup, VmRange};
use crate::types::{MemObjId, PageIndex, TaskId, VirtAddr};

pub use registry::{generic_object, registry, MemObjRegistry};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Memory object flags; the low four bits select the lifetime policy.
    pub struct MemObjFlags: u32 {
        /// Destroyed when the last pin is dropped.
        const EPHEMERAL = 1 << 0;
        /// Survives with no pins until released explicitly.
        const STICKY = 1 << 1;
        /// Survives with no pins until the next reclaim pass.
        const RECLAIM = 1 << 2;
        /// Never destroyed.
        const IMMORTAL = 1 << 3;
        /// Mappings share frames instead of copying on write.
        const SHARED = 1 << 4;
        /// A pager backend is attached.
        const BACKENDED = 1 << 5;
        /// Object is being destroyed.
        const INACTIVE = 1 << 6;
    }
}

impl MemObjFlags {
    /// All lifetime policy bits.
    pub const LIFETIME: Self = Self::EPHEMERAL
        .union(Self::STICKY)
        .union(Self::RECLAIM)
        .union(Self::IMMORTAL);
    /// Bits only the kernel may set.
    pub const KERNEL_OWNED: Self = Self::BACKENDED.union(Self::INACTIVE);

    /// Returns `true` when exactly one lifetime bit is set.
    pub fn has_single_lifetime(self) -> bool {
        self.intersection(Self::LIFETIME).bits().count_ones() == 1
    }
}

/// Kind of memory object; selects its operation table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Nature {
    Generic = 0,
    PageCache = 1,
    Proxy = 2,
}

impl Nature {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Generic),
            1 => Some(Self::PageCache),
            2 => Some(Self::Proxy),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    fn ops(self) -> &'static dyn MemObjOps {
        match self {
            Self::Generic => &generic::GenericOps,
            Self::PageCache => &page_cache::PageCacheOps,
            Self::Proxy => &proxy::ProxyOps,
        }
    }
}

/// Pager server task as seen by the VM core.
pub trait ServerTask: RangeLookup + Send + Sync {
    fn task_id(&self) -> TaskId;
    fn address_space(&self) -> &AddressSpace;
}

/// Out-of-kernel pager attached to a proxy object.
pub struct Backend {
    server: Weak<dyn ServerTask>,
    channel: Arc<dyn Channel>,
    tag: u64,
}

impl Backend {
    pub fn new(server: Weak<dyn ServerTask>, channel: Arc<dyn Channel>, tag: u64) -> Self {
        Self { server, channel, tag }
    }

    /// Opaque value chosen by the server and echoed in every request.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Server task, if it is still alive.
    pub fn server(&self) -> Option<Arc<dyn ServerTask>> {
        self.server.upgrade()
    }

    /// Pinned handle on the channel for the duration of one round-trip.
    pub fn channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.channel)
    }
}

/// Per-nature operation table. Unimplemented operations report `NotSupported`.
#[allow(unused_variables)]
pub trait MemObjOps: Send + Sync {
    /// Resolves `fault` for a page of `obj`.
    fn handle_page_fault(&self, obj: &MemObject, fault: &Fault<'_>) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Maps the caller-provided `frame` at `va`.
    fn insert_page(
        &self,
        obj: &MemObject,
        space: &AddressSpace,
        va: VirtAddr,
        frame: PageIndex,
        attrs: PageAttrs,
    ) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Removes the page mapped at `va` and drops its frame pin.
    fn delete_page(&self, obj: &MemObject, space: &AddressSpace, va: VirtAddr) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Makes `pages` pages of `range` starting at `va` present.
    fn populate_pages(
        &self,
        obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Unmaps the present pages among `pages` pages of `range` starting at `va`.
    fn depopulate_pages(
        &self,
        obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    fn truncate(&self, obj: &MemObject, size_pages: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Tells the backend its pages are no longer mapped by the kernel.
    fn unmap_ack(&self, obj: &MemObject) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Asks whether a mapping of `pages` pages at `offset` may be created.
    fn mmap_check(&self, obj: &MemObject, offset: u64, pages: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Writes back the present pages among `pages` pages of `range` starting at `va`.
    fn msync(
        &self,
        obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Releases nature-specific resources at destruction.
    fn cleanup(&self, obj: &MemObject) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
}

/// A memory object.
///
/// **Lifecycle**: created by [`MemObjRegistry::create`], pinned by
/// [`MemObjRef`] handles, destroyed according to its lifetime flag.
pub struct MemObject {
    id: MemObjId,
    nature: Nature,
    size_pages: AtomicU64,
    refcount: AtomicUsize,
    flags: AtomicU32,
    backend: Option<Backend>,
}

impl MemObject {
    fn new(
        id: MemObjId,
        nature: Nature,
        size_pages: u64,
        flags: MemObjFlags,
        backend: Option<Backend>,
    ) -> Self {
        Self {
            id,
            nature,
            size_pages: AtomicU64::new(size_pages),
            refcount: AtomicUsize::new(1),
            flags: AtomicU32::new(flags.bits()),
            backend,
        }
    }

    pub fn id(&self) -> MemObjId {
        self.id
    }

    pub fn nature(&self) -> Nature {
        self.nature
    }

    pub fn size_pages(&self) -> u64 {
        self.size_pages.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> MemObjFlags {
        MemObjFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: MemObjFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn clear_flags(&self, flags: MemObjFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Current pin count.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn backend(&self) -> Option<&Backend> {
        self.backend.as_ref()
    }

    fn ensure_active(&self) -> VmResult<()> {
        if self.flags().contains(MemObjFlags::INACTIVE) {
            return Err(VmError::Canceled);
        }
        Ok(())
    }

    fn ops(&self) -> &'static dyn MemObjOps {
        self.nature.ops()
    }

    pub fn handle_page_fault(&self, fault: &Fault<'_>) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().handle_page_fault(self, fault)
    }

    pub fn insert_page(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        frame: PageIndex,
        attrs: PageAttrs,
    ) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().insert_page(self, space, va, frame, attrs)
    }

    pub fn delete_page(&self, space: &AddressSpace, va: VirtAddr) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().delete_page(self, space, va)
    }

    pub fn populate_pages(
        &self,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().populate_pages(self, space, range, va, pages)
    }

    pub fn depopulate_pages(
        &self,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().depopulate_pages(self, space, range, va, pages)
    }

    pub fn truncate(&self, size_pages: u64) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().truncate(self, size_pages)
    }

    pub fn unmap_ack(&self) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().unmap_ack(self)
    }

    /// Admission check for a new mapping of `pages` pages at object `offset`.
    pub fn mmap_check(&self, offset: u64, pages: u64) -> VmResult<()> {
        self.ensure_active()?;
        let end = offset.checked_add(pages).ok_or(VmError::InvalidArgs)?;
        if pages == 0 || end > self.size_pages() {
            return Err(VmError::InvalidArgs);
        }
        self.ops().mmap_check(self, offset, pages)
    }

    pub fn msync(
        &self,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        self.ensure_active()?;
        self.ops().msync(self, space, range, va, pages)
    }
}

impl fmt::Debug for MemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemObject")
            .field("id", &self.id)
            .field("nature", &self.nature)
            .field("size_pages", &self.size_pages())
            .field("refcount", &self.refcount())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Counted pin on a memory object.
///
/// Cloning takes a pin, dropping releases it; the drop that releases the
/// last pin applies the object's lifetime policy.
pub struct MemObjRef(Arc<MemObject>);

impl MemObjRef {
    /// Wraps an object whose pin the caller has already taken.
    fn adopt(obj: Arc<MemObject>) -> Self {
        Self(obj)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for MemObjRef {
    type Target = MemObject;

    fn deref(&self) -> &MemObject {
        &self.0
    }
}

impl Clone for MemObjRef {
    fn clone(&self) -> Self {
        self.0.refcount.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(&self.0))
    }
}

impl Drop for MemObjRef {
    fn drop(&mut self) {
        let prev = self.0.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "memory object {} refcount underflow", self.0.id);
        if prev == 1 && self.0.flags().contains(MemObjFlags::EPHEMERAL) {
            registry().destroy(&self.0);
        }
    }
}

impl fmt::Debug for MemObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}
