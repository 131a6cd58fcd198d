// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Global memory-object index, id allocation and lifetime policy
//! OWNERS: @kernel-mm-team
//! PUBLIC API: registry(), generic_object(), MemObjRegistry::{create, lookup, release, reclaim_idle, len}
//! DEPENDS_ON: spin::{RwLock, Mutex, Once}
//! INVARIANTS:
//!   - Index is write-locked for create/destroy and read-locked for lookup
//!   - Destruction re-checks identity and a zero count under the write lock
//!   - cleanup runs after the index lock is dropped

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once, RwLock};

use super::{Backend, MemObjFlags, MemObjRef, MemObject, Nature};
use crate::error::{VmError, VmResult};
use crate::mm::VPN_LIMIT;
use crate::types::MemObjId;

/// Capacity used when the registry is reached before `init`.
pub const DEFAULT_MAX_MEMORY_OBJECTS: usize = 4096;

const WORD_BITS: usize = u64::BITS as usize;

static REGISTRY: Once<MemObjRegistry> = Once::new();
static GENERIC: Once<MemObjRef> = Once::new();

/// Global registry, created with the default capacity on first use.
pub fn registry() -> &'static MemObjRegistry {
    REGISTRY.call_once(|| MemObjRegistry::new(DEFAULT_MAX_MEMORY_OBJECTS))
}

/// Builds the registry with `capacity` ids unless it already exists.
pub(crate) fn init_registry(capacity: usize) -> &'static MemObjRegistry {
    REGISTRY.call_once(|| MemObjRegistry::new(capacity))
}

/// The anonymous-memory singleton, created on first use.
pub fn generic_object() -> VmResult<MemObjRef> {
    GENERIC
        .try_call_once(|| {
            let obj = registry().insert(Nature::Generic, VPN_LIMIT, MemObjFlags::IMMORTAL, None)?;
            log::info!(target: "memobj", "MEMOBJ: generic object id {}", obj.id());
            Ok(obj)
        })
        .map(MemObjRef::clone)
}

/// Bitmap id allocator; id 0 is reserved.
struct IdAllocator {
    bitmap: Vec<u64>,
    capacity: usize,
    next: usize,
}

impl IdAllocator {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let mut bitmap = vec![0u64; capacity.div_ceil(WORD_BITS)];
        bitmap[0] |= 1;
        Self { bitmap, capacity, next: 1 }
    }

    fn allocate(&mut self) -> Option<MemObjId> {
        for _ in 0..self.capacity {
            let index = self.next % self.capacity;
            let word = index / WORD_BITS;
            let bit = index % WORD_BITS;
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                self.next = (index + 1) % self.capacity;
                return Some(MemObjId::from_raw(index as u32));
            }
            self.next = index + 1;
        }
        None
    }

    fn free(&mut self, id: MemObjId) {
        let index = id.as_index();
        if index == 0 || index >= self.capacity {
            return;
        }
        self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }
}

/// Index of all live memory objects.
pub struct MemObjRegistry {
    index: RwLock<BTreeMap<MemObjId, Arc<MemObject>>>,
    ids: Mutex<IdAllocator>,
}

impl MemObjRegistry {
    fn new(capacity: usize) -> Self {
        Self { index: RwLock::new(BTreeMap::new()), ids: Mutex::new(IdAllocator::new(capacity)) }
    }

    /// Creates a page-cache or proxy object and returns the creator's pin.
    ///
    /// The generic object is a singleton reached through [`generic_object`].
    pub fn create(
        &self,
        nature: Nature,
        size_pages: u64,
        flags: MemObjFlags,
        backend: Option<Backend>,
    ) -> VmResult<MemObjRef> {
        if nature == Nature::Generic {
            return Err(VmError::PermissionDenied);
        }
        self.insert(nature, size_pages, flags, backend)
    }

    fn insert(
        &self,
        nature: Nature,
        size_pages: u64,
        flags: MemObjFlags,
        backend: Option<Backend>,
    ) -> VmResult<MemObjRef> {
        if size_pages == 0 || size_pages > VPN_LIMIT {
            return Err(VmError::InvalidArgs);
        }
        if !flags.has_single_lifetime() || flags.intersects(MemObjFlags::KERNEL_OWNED) {
            return Err(VmError::InvalidArgs);
        }
        if (nature == Nature::Proxy) != backend.is_some() {
            return Err(VmError::InvalidArgs);
        }
        let flags = if backend.is_some() { flags | MemObjFlags::BACKENDED } else { flags };
        let id = self.ids.lock().allocate().ok_or(VmError::OutOfMemory)?;
        let obj = Arc::new(MemObject::new(id, nature, size_pages, flags, backend));
        self.index.write().insert(id, Arc::clone(&obj));
        log::debug!(
            target: "memobj",
            "MEMOBJ: create id {} {:?} pages {} flags {:?}",
            id,
            nature,
            size_pages,
            flags
        );
        Ok(MemObjRef::adopt(obj))
    }

    /// Pins the live object registered under `id`.
    ///
    /// A STICKY or RECLAIM object sitting at zero pins is revived.
    pub fn lookup(&self, id: MemObjId) -> Option<MemObjRef> {
        let index = self.index.read();
        let obj = index.get(&id)?;
        if obj.flags().contains(MemObjFlags::INACTIVE) {
            return None;
        }
        obj.refcount.fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        Some(MemObjRef::adopt(Arc::clone(obj)))
    }

    /// Drops the STICKY hold on `id`: the object becomes EPHEMERAL and is
    /// destroyed now if nothing pins it.
    pub fn release(&self, id: MemObjId) -> VmResult<()> {
        let obj = {
            let index = self.index.read();
            let obj = index.get(&id).ok_or(VmError::InvalidArgs)?;
            if !obj.flags().contains(MemObjFlags::STICKY) {
                return Err(VmError::InvalidArgs);
            }
            obj.set_flags(MemObjFlags::EPHEMERAL);
            obj.clear_flags(MemObjFlags::STICKY);
            Arc::clone(obj)
        };
        if obj.refcount() == 0 {
            self.destroy(&obj);
        }
        Ok(())
    }

    /// Drops the creator pin of a freshly created object and destroys it
    /// whatever its lifetime flag, unless someone else pinned it meanwhile.
    pub fn discard(&self, obj: MemObjRef) -> bool {
        let inner = Arc::clone(&obj.0);
        drop(obj);
        self.destroy(&inner)
    }

    /// Destroys every RECLAIM object that currently has no pins.
    pub fn reclaim_idle(&self) -> usize {
        let idle: Vec<Arc<MemObject>> = self
            .index
            .read()
            .values()
            .filter(|obj| obj.flags().contains(MemObjFlags::RECLAIM) && obj.refcount() == 0)
            .cloned()
            .collect();
        let reclaimed = idle.iter().filter(|obj| self.destroy(obj)).count();
        if reclaimed != 0 {
            log::debug!(target: "memobj", "MEMOBJ: reclaimed {} idle objects", reclaimed);
        }
        reclaimed
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `obj` if it is still registered, unpinned and mortal, then
    /// runs its cleanup. Returns `true` for the single caller that did so.
    pub(super) fn destroy(&self, obj: &Arc<MemObject>) -> bool {
        {
            let mut index = self.index.write();
            match index.get(&obj.id) {
                Some(current) if Arc::ptr_eq(current, obj) => {}
                _ => return false,
            }
            if obj.refcount() != 0 || obj.flags().contains(MemObjFlags::IMMORTAL) {
                return false;
            }
            obj.set_flags(MemObjFlags::INACTIVE);
            index.remove(&obj.id);
        }
        if let Err(err) = obj.ops().cleanup(obj) {
            log::warn!(target: "memobj", "MEMOBJ: cleanup of {} failed: {}", obj.id, err);
        }
        self.ids.lock().free(obj.id);
        log::debug!(target: "memobj", "MEMOBJ: destroyed id {}", obj.id);
        true
    }
}
