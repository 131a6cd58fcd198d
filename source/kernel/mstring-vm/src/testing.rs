// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Host doubles for the VM core's external collaborators
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; frame arena, recording rmap, pager server/channel and syscall caller

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::ipc::{Channel, IpcError, Message};
use crate::memobj::{
    generic_object, registry, Backend, MemObjFlags, MemObjRef, Nature, ServerTask,
};
use crate::mm::{
    AddressSpace, FramePool, PageAttrs, PageFrame, Pde, RangeLookup, ReverseMap, VmRange,
    PAGE_SIZE,
};
use crate::syscall::api::CallerTask;
use crate::types::{AsId, MemObjId, PageIndex, PortId, TaskId, VirtAddr};

const WORDS: usize = PAGE_SIZE / 8;
/// First frame index handed out by the arena.
const BASE: u64 = 0x1000;

/// Fixed arena of host memory standing in for physical frames.
pub struct HostFramePool {
    descs: Vec<PageFrame>,
    pages: Vec<Mutex<Box<[u64; WORDS]>>>,
    allocated: Vec<AtomicBool>,
    free: Mutex<Vec<PageIndex>>,
    /// Allocations left before `alloc_frame` starts failing.
    budget: AtomicUsize,
}

impl HostFramePool {
    pub fn new(frames: usize) -> Self {
        let descs = (0..frames).map(|_| PageFrame::new()).collect();
        let pages = (0..frames).map(|_| Mutex::new(Box::new([0u64; WORDS]))).collect();
        let allocated = (0..frames).map(|_| AtomicBool::new(false)).collect();
        // Lowest indices are handed out first.
        let free = (0..frames as u64).rev().map(|i| PageIndex::from_raw(BASE + i)).collect();
        Self {
            descs,
            pages,
            allocated,
            free: Mutex::new(free),
            budget: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn shared(frames: usize) -> Arc<Self> {
        Arc::new(Self::new(frames))
    }

    /// Lets `n` more allocations succeed, then fails every following one.
    pub fn fail_after(&self, n: usize) {
        self.budget.store(n, Ordering::SeqCst);
    }

    pub fn clear_failure(&self) {
        self.budget.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn is_allocated(&self, index: PageIndex) -> bool {
        self.allocated[self.slot(index)].load(Ordering::SeqCst)
    }

    pub fn write_bytes(&self, index: PageIndex, offset: usize, bytes: &[u8]) {
        let mut page = self.pages[self.slot(index)].lock();
        for (i, byte) in bytes.iter().enumerate() {
            let at = offset + i;
            let shift = (at % 8) * 8;
            let word = &mut page[at / 8];
            *word = (*word & !(0xffu64 << shift)) | (u64::from(*byte) << shift);
        }
    }

    pub fn read_bytes(&self, index: PageIndex, offset: usize, len: usize) -> Vec<u8> {
        let page = self.pages[self.slot(index)].lock();
        (offset..offset + len).map(|at| (page[at / 8] >> ((at % 8) * 8)) as u8).collect()
    }

    fn slot(&self, index: PageIndex) -> usize {
        let raw = index.as_raw();
        assert!(raw >= BASE && raw - BASE < self.descs.len() as u64, "foreign frame {}", index);
        (raw - BASE) as usize
    }

    fn take_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl FramePool for HostFramePool {
    fn alloc_frame(&self) -> Option<PageIndex> {
        if !self.take_budget() {
            return None;
        }
        let index = self.free.lock().pop()?;
        let slot = self.slot(index);
        assert_eq!(self.descs[slot].refcount(), 0);
        self.descs[slot].reset();
        self.pages[slot].lock().fill(0);
        self.allocated[slot].store(true, Ordering::SeqCst);
        Some(index)
    }

    fn free_frame(&self, index: PageIndex) {
        let slot = self.slot(index);
        assert!(self.allocated[slot].swap(false, Ordering::SeqCst), "double free of {}", index);
        assert_eq!(self.descs[slot].refcount(), 0, "freeing pinned frame {}", index);
        self.descs[slot].reset();
        self.free.lock().push(index);
    }

    fn frame(&self, index: PageIndex) -> &PageFrame {
        &self.descs[self.slot(index)]
    }

    fn read_pde(&self, dir: PageIndex, slot: usize) -> Pde {
        Pde::from_raw(self.pages[self.slot(dir)].lock()[slot])
    }

    fn write_pde(&self, dir: PageIndex, slot: usize, pde: Pde) {
        self.pages[self.slot(dir)].lock()[slot] = pde.raw();
    }

    fn copy_frame(&self, dst: PageIndex, src: PageIndex) {
        let data = **self.pages[self.slot(src)].lock();
        **self.pages[self.slot(dst)].lock() = data;
    }

    fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Reverse-map state of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RmapEntry {
    Anon { space: AsId, va: VirtAddr },
    Shared { memobj: MemObjId, users: Vec<(AsId, VirtAddr)> },
}

/// Reverse map that records every registration.
#[derive(Default)]
pub struct RecordingRmap {
    frames: Mutex<BTreeMap<PageIndex, RmapEntry>>,
    fail: AtomicBool,
}

impl RecordingRmap {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following registration fail with `OutOfMemory`.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn entry(&self, frame: PageIndex) -> Option<RmapEntry> {
        self.frames.lock().get(&frame).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    fn check(&self) -> VmResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(VmError::OutOfMemory)
        } else {
            Ok(())
        }
    }
}

impl ReverseMap for RecordingRmap {
    fn register_anon(&self, frame: PageIndex, space: AsId, va: VirtAddr) -> VmResult<()> {
        self.check()?;
        let prev = self.frames.lock().insert(frame, RmapEntry::Anon { space, va });
        assert!(prev.is_none(), "{} already tracked as {:?}", frame, prev);
        Ok(())
    }

    fn register_shared(
        &self,
        frame: PageIndex,
        space: AsId,
        va: VirtAddr,
        memobj: MemObjId,
    ) -> VmResult<()> {
        self.check()?;
        let mut frames = self.frames.lock();
        let entry = frames.entry(frame).or_insert(RmapEntry::Shared { memobj, users: Vec::new() });
        match entry {
            RmapEntry::Shared { users, .. } => users.push((space, va)),
            RmapEntry::Anon { .. } => panic!("{} is anonymous", frame),
        }
        Ok(())
    }

    fn unregister(&self, frame: PageIndex, space: AsId, va: VirtAddr) {
        let mut frames = self.frames.lock();
        let remove = match frames.get_mut(&frame) {
            Some(RmapEntry::Anon { space: s, va: v }) => {
                assert_eq!((*s, *v), (space, va));
                true
            }
            Some(RmapEntry::Shared { users, .. }) => {
                let before = users.len();
                users.retain(|user| *user != (space, va));
                assert_eq!(users.len() + 1, before, "{} not mapped by {} at {}", frame, space, va);
                users.is_empty()
            }
            None => panic!("{} not tracked", frame),
        };
        if remove {
            frames.remove(&frame);
        }
    }

    fn anon_to_shared(&self, frame: PageIndex, memobj: MemObjId) -> VmResult<()> {
        self.check()?;
        let mut frames = self.frames.lock();
        match frames.get(&frame) {
            Some(RmapEntry::Anon { space, va }) => {
                let users = vec![(*space, *va)];
                frames.insert(frame, RmapEntry::Shared { memobj, users });
                Ok(())
            }
            _ => Err(VmError::Fault),
        }
    }
}

/// Pager server task with its own address space and VM ranges.
pub struct TestServer {
    task: TaskId,
    space: AddressSpace,
    ranges: Mutex<Vec<VmRange>>,
}

impl TestServer {
    pub fn new(task: TaskId, space: AsId, pool: Arc<HostFramePool>) -> Arc<Self> {
        Self::with_rmap(task, space, pool, RecordingRmap::shared())
    }

    pub fn with_rmap(
        task: TaskId,
        space: AsId,
        pool: Arc<HostFramePool>,
        rmap: Arc<RecordingRmap>,
    ) -> Arc<Self> {
        let space = AddressSpace::new(space, pool, rmap).unwrap();
        Arc::new(Self { task, space, ranges: Mutex::new(Vec::new()) })
    }

    pub fn add_range(&self, range: VmRange) {
        self.ranges.lock().push(range);
    }

    pub fn weak(self: &Arc<Self>) -> Weak<dyn ServerTask> {
        let server: Arc<dyn ServerTask> = self.clone();
        Arc::downgrade(&server)
    }
}

impl RangeLookup for TestServer {
    fn find_range(&self, addr: VirtAddr) -> Option<VmRange> {
        self.ranges.lock().iter().find(|range| range.contains(addr)).cloned()
    }
}

impl ServerTask for TestServer {
    fn task_id(&self) -> TaskId {
        self.task
    }

    fn address_space(&self) -> &AddressSpace {
        &self.space
    }
}

type Pager = dyn Fn(&Message) -> Option<Message> + Send + Sync;

/// In-process channel answering requests with a closure.
///
/// A closure returning `None` behaves like a dead peer.
pub struct LoopbackChannel {
    pager: Box<Pager>,
    requests: Mutex<Vec<Message>>,
    notifications: Mutex<Vec<Message>>,
}

impl LoopbackChannel {
    pub fn new(pager: impl Fn(&Message) -> Option<Message> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            pager: Box::new(pager),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Message> {
        self.notifications.lock().clone()
    }
}

impl Channel for LoopbackChannel {
    fn call(&self, request: Message) -> Result<Message, IpcError> {
        // Go through the wire encoding like a real transport would.
        let request = Message::from_frame(&request.to_frame())?;
        self.requests.lock().push(request.clone());
        (self.pager)(&request).ok_or(IpcError::Disconnected)
    }

    fn notify(&self, message: Message) -> Result<(), IpcError> {
        self.notifications.lock().push(message);
        Ok(())
    }
}

/// Syscall caller recording user copies and adopted objects.
#[derive(Default)]
pub struct TestCaller {
    pub adopted: Vec<MemObjRef>,
    pub fail_copies: bool,
    /// Payloads of copies refused while `fail_copies` was set.
    pub rejected: Vec<Vec<u8>>,
    writes: BTreeMap<u64, Vec<u8>>,
    ports: BTreeMap<PortId, (Weak<dyn ServerTask>, Arc<dyn Channel>)>,
}

impl TestCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(
        &mut self,
        port: PortId,
        server: Arc<TestServer>,
        channel: Arc<LoopbackChannel>,
    ) {
        let channel: Arc<dyn Channel> = channel;
        self.ports.insert(port, (server.weak(), channel));
    }

    pub fn written(&self, addr: u64) -> Option<Vec<u8>> {
        self.writes.get(&addr).cloned()
    }
}

impl CallerTask for TestCaller {
    fn copy_to_user(&mut self, dst: u64, bytes: &[u8]) -> Result<(), VmError> {
        if self.fail_copies || dst == 0 {
            self.rejected.push(bytes.to_vec());
            return Err(VmError::Fault);
        }
        self.writes.insert(dst, bytes.to_vec());
        Ok(())
    }

    fn resolve_port(&self, port: PortId) -> Option<(Weak<dyn ServerTask>, Arc<dyn Channel>)> {
        self.ports.get(&port).cloned()
    }

    fn adopt_memobj(&mut self, obj: MemObjRef) {
        self.adopted.push(obj);
    }
}

/// Address space over `pool` with a fresh recording rmap.
pub fn space(id: u32, pool: &Arc<HostFramePool>, rmap: &Arc<RecordingRmap>) -> AddressSpace {
    AddressSpace::new(AsId::from_raw(id), pool.clone(), rmap.clone()).unwrap()
}

/// Private anonymous range backed by the generic object.
pub fn anon_range(start: u64, pages: u64, attrs: PageAttrs) -> VmRange {
    VmRange {
        start: VirtAddr::page_aligned(start).unwrap(),
        pages,
        attrs,
        memobj: generic_object().unwrap(),
        offset: start >> 12,
    }
}

/// Proxy object of `pages` pages served by `server` over `channel`.
pub fn proxy_object(
    server: &Arc<TestServer>,
    channel: Arc<LoopbackChannel>,
    pages: u64,
    tag: u64,
) -> MemObjRef {
    let backend = Backend::new(server.weak(), channel, tag);
    registry()
        .create(Nature::Proxy, pages, MemObjFlags::EPHEMERAL | MemObjFlags::SHARED, Some(backend))
        .unwrap()
}

pub const RW_USER: PageAttrs = PageAttrs::READ.union(PageAttrs::WRITE).union(PageAttrs::USER);
