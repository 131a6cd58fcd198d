// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Unit tests for fault resolution and copy-on-write
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; anonymous ranges over a host frame arena
//!
//! TEST_SCOPE:
//!   - demand zero fill, read-only first touch and write grant
//!   - fork sharing and COW break with content preservation
//!   - rollback when the reverse map or the allocator fails
//!   - trap dispositions

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::cow::share_range_for_fork;
use super::{
    handle_user_fault, resolve, resolve_anon_not_present, Fault, FaultDisposition, FaultMask,
    Signal,
};
use crate::diag::stats::stats;
use crate::error::VmError;
use crate::ipc::Message;
use crate::mm::{FrameFlags, FramePool, PageAttrs, RangeLookup, ReverseMap, VmRange};
use crate::testing::{
    anon_range, proxy_object, space, HostFramePool, LoopbackChannel, RecordingRmap, RmapEntry,
    TestServer, RW_USER,
};
use crate::types::{AsId, TaskId, VirtAddr};

const READ: FaultMask = FaultMask::USER;
const WRITE: FaultMask = FaultMask::USER.union(FaultMask::WRITE);
const WRITE_PROT: FaultMask = WRITE.union(FaultMask::PRESENT);

struct Ranges(Vec<VmRange>);

impl RangeLookup for Ranges {
    fn find_range(&self, addr: VirtAddr) -> Option<VmRange> {
        self.0.iter().find(|range| range.contains(addr)).cloned()
    }
}

fn va(addr: u64) -> VirtAddr {
    VirtAddr::page_aligned(addr).unwrap()
}

#[test]
fn read_touch_is_read_only_until_written() {
    let pool = HostFramePool::shared(32);
    let rmap = RecordingRmap::shared();
    let space = space(1, &pool, &rmap);
    let range = anon_range(0x40_0000, 4, RW_USER);

    resolve(&space, &range, va(0x40_1000), READ).unwrap();
    let entry = space.lock_table().entry(va(0x40_1000)).unwrap();
    assert!(!entry.is_writable());
    let frame = entry.frame();
    assert_eq!(pool.frame(frame).offset(), (0x40_1000 >> 12) as u64);
    assert_eq!(
        rmap.entry(frame),
        Some(RmapEntry::Anon { space: AsId::from_raw(1), va: va(0x40_1000) })
    );

    let grants = stats().write_grants.load(Ordering::Relaxed);
    resolve(&space, &range, VirtAddr::new(0x40_1abc).unwrap(), WRITE_PROT).unwrap();
    let entry = space.lock_table().entry(va(0x40_1000)).unwrap();
    assert!(entry.is_writable());
    assert_eq!(entry.frame(), frame);
    assert_eq!(pool.frame(frame).refcount(), 1);
    assert!(stats().write_grants.load(Ordering::Relaxed) > grants);
}

#[test]
fn write_touch_maps_writable_zero_page() {
    let pool = HostFramePool::shared(32);
    let rmap = RecordingRmap::shared();
    let space = space(1, &pool, &rmap);
    let range = anon_range(0x40_0000, 1, RW_USER);

    resolve(&space, &range, va(0x40_0000), WRITE).unwrap();
    let entry = space.lock_table().entry(va(0x40_0000)).unwrap();
    assert!(entry.is_writable());
    assert_eq!(pool.read_bytes(entry.frame(), 0, 16), vec![0u8; 16]);
}

#[test]
fn access_outside_range_rights_is_refused() {
    let pool = HostFramePool::shared(32);
    let rmap = RecordingRmap::shared();
    let space = space(1, &pool, &rmap);
    let range = anon_range(0x40_0000, 2, PageAttrs::READ | PageAttrs::USER);

    assert_eq!(resolve(&space, &range, va(0x40_0000), WRITE), Err(VmError::Fault));
    assert_eq!(resolve(&space, &range, va(0x40_0000), READ | FaultMask::EXEC), Err(VmError::Fault));
    assert_eq!(resolve(&space, &range, va(0x40_2000), READ), Err(VmError::Fault));
    assert_eq!(space.translate(va(0x40_0000)), None);
}

#[test]
fn lost_race_frees_the_spare_frame() {
    let pool = HostFramePool::shared(32);
    let rmap = RecordingRmap::shared();
    let space = space(1, &pool, &rmap);
    let range = anon_range(0x40_0000, 1, RW_USER);

    resolve(&space, &range, va(0x40_0000), READ).unwrap();
    let frame = space.translate(va(0x40_0000)).unwrap();
    let free = pool.free_count();
    let races = stats().races.load(Ordering::Relaxed);

    resolve_anon_not_present(&Fault::new(&space, &range, va(0x40_0000), READ)).unwrap();
    assert_eq!(space.translate(va(0x40_0000)), Some(frame));
    assert_eq!(pool.free_count(), free);
    assert!(stats().races.load(Ordering::Relaxed) > races);
}

#[test]
fn rmap_failure_leaves_no_mapping() {
    let pool = HostFramePool::shared(32);
    let rmap = RecordingRmap::shared();
    let space = space(1, &pool, &rmap);
    let range = anon_range(0x40_0000, 1, RW_USER);
    let free = pool.free_count();

    rmap.set_fail(true);
    assert_eq!(resolve(&space, &range, va(0x40_0000), WRITE), Err(VmError::OutOfMemory));
    assert_eq!(space.translate(va(0x40_0000)), None);
    assert!(rmap.is_empty());
    assert_eq!(pool.free_count(), free);
    space.lock_table().verify().unwrap();
}

#[test]
fn fork_then_child_write_copies_once() {
    let pool = HostFramePool::shared(64);
    let rmap = RecordingRmap::shared();
    let parent = space(1, &pool, &rmap);
    let child = space(2, &pool, &rmap);
    let range = anon_range(0x80_0000, 4, RW_USER);
    let page2 = va(0x80_2000);

    resolve(&parent, &range, page2, WRITE).unwrap();
    let original = parent.translate(page2).unwrap();
    pool.write_bytes(original, 100, b"parent data");

    share_range_for_fork(&parent, &child, &range).unwrap();
    assert_eq!(child.translate(page2), Some(original));
    assert_eq!(child.translate(va(0x80_0000)), None);
    assert_eq!(pool.frame(original).refcount(), 2);
    assert!(pool.frame(original).flags().contains(FrameFlags::COW | FrameFlags::SHARED));
    assert!(!parent.lock_table().entry(page2).unwrap().is_writable());
    assert!(!child.lock_table().entry(page2).unwrap().is_writable());

    let copies = stats().cow_copies.load(Ordering::Relaxed);
    resolve(&child, &range, page2, WRITE_PROT).unwrap();
    let copy = child.translate(page2).unwrap();
    assert_ne!(copy, original);
    assert!(stats().cow_copies.load(Ordering::Relaxed) > copies);
    assert_eq!(pool.frame(original).refcount(), 1);
    assert_eq!(pool.frame(copy).refcount(), 1);
    assert_eq!(pool.read_bytes(copy, 100, 11), b"parent data".to_vec());
    assert!(child.lock_table().entry(page2).unwrap().is_writable());
    assert_eq!(rmap.entry(copy), Some(RmapEntry::Anon { space: AsId::from_raw(2), va: page2 }));

    // Parent's write copies too; the last user of the shared frame frees it.
    pool.write_bytes(copy, 100, b"child");
    resolve(&parent, &range, page2, WRITE_PROT).unwrap();
    let parent_copy = parent.translate(page2).unwrap();
    assert!(!pool.is_allocated(original));
    assert!(rmap.entry(original).is_none());
    assert_eq!(pool.read_bytes(parent_copy, 100, 11), b"parent data".to_vec());
    assert_eq!(pool.read_bytes(copy, 100, 5), b"child".to_vec());

    parent.lock_table().verify().unwrap();
    child.lock_table().verify().unwrap();
}

#[test]
fn failed_cow_break_keeps_the_shared_mapping() {
    let pool = HostFramePool::shared(64);
    let rmap = RecordingRmap::shared();
    let parent = space(1, &pool, &rmap);
    let child = space(2, &pool, &rmap);
    let range = anon_range(0x80_0000, 1, RW_USER);

    resolve(&parent, &range, va(0x80_0000), WRITE).unwrap();
    share_range_for_fork(&parent, &child, &range).unwrap();
    let shared = child.translate(va(0x80_0000)).unwrap();
    let free = pool.free_count();

    rmap.set_fail(true);
    assert_eq!(resolve(&child, &range, va(0x80_0000), WRITE_PROT), Err(VmError::OutOfMemory));
    rmap.set_fail(false);
    assert_eq!(child.translate(va(0x80_0000)), Some(shared));
    assert_eq!(pool.frame(shared).refcount(), 2);
    assert_eq!(pool.free_count(), free);

    pool.fail_after(0);
    assert_eq!(resolve(&child, &range, va(0x80_0000), WRITE_PROT), Err(VmError::OutOfMemory));
    pool.clear_failure();
    assert_eq!(pool.frame(shared).refcount(), 2);
}

#[test]
fn fork_of_shared_object_maps_same_frame_writable() {
    let pool = HostFramePool::shared(64);
    let rmap = RecordingRmap::shared();
    let server = TestServer::new(TaskId::from_raw(7), AsId::from_raw(70), pool.clone());
    let channel = LoopbackChannel::new(|_: &Message| None);
    let memobj = proxy_object(&server, channel, 4, 0);
    let parent = space(1, &pool, &rmap);
    let child = space(2, &pool, &rmap);
    let range = VmRange { start: va(0x90_0000), pages: 4, attrs: RW_USER, memobj, offset: 0 };

    let frame = pool.alloc_frame().unwrap();
    parent.lock_table().map_one(va(0x90_1000), frame, RW_USER).unwrap();
    rmap.register_shared(frame, parent.id(), va(0x90_1000), range.memobj.id()).unwrap();

    share_range_for_fork(&parent, &child, &range).unwrap();
    assert_eq!(child.translate(va(0x90_1000)), Some(frame));
    assert!(child.lock_table().entry(va(0x90_1000)).unwrap().is_writable());
    assert!(parent.lock_table().entry(va(0x90_1000)).unwrap().is_writable());
    assert_eq!(pool.frame(frame).refcount(), 2);
    assert!(!pool.frame(frame).flags().contains(FrameFlags::COW));
    match rmap.entry(frame) {
        Some(RmapEntry::Shared { users, .. }) => assert_eq!(users.len(), 2),
        other => panic!("unexpected rmap entry {:?}", other),
    }
}

#[test]
fn trap_dispositions() {
    let pool = HostFramePool::shared(32);
    let rmap = RecordingRmap::shared();
    let space = space(1, &pool, &rmap);
    let ranges = Ranges(vec![anon_range(0x40_0000, 2, RW_USER)]);

    assert_eq!(handle_user_fault(&space, &ranges, 0x40_0010, WRITE), FaultDisposition::Resolved);
    assert_eq!(
        handle_user_fault(&space, &ranges, 0x50_0000, READ),
        FaultDisposition::Signal(Signal::Segv)
    );
    assert_eq!(
        handle_user_fault(&space, &ranges, 0x0000_8000_0000_0000, READ),
        FaultDisposition::Signal(Signal::Segv)
    );
    assert_eq!(
        handle_user_fault(&space, &ranges, 0x50_0000, FaultMask::empty()),
        FaultDisposition::Fatal
    );

    pool.fail_after(0);
    assert_eq!(
        handle_user_fault(&space, &ranges, 0x40_1000, READ),
        FaultDisposition::Signal(Signal::Kill)
    );
    pool.clear_failure();
    assert_eq!(handle_user_fault(&space, &ranges, 0x40_1000, READ), FaultDisposition::Resolved);
}

#[test]
fn dropping_a_space_returns_every_frame() {
    let pool = HostFramePool::shared(16);
    let rmap: Arc<RecordingRmap> = RecordingRmap::shared();
    let baseline = pool.free_count();
    {
        let space = space(3, &pool, &rmap);
        let range = anon_range(0x40_0000, 3, RW_USER);
        for page in 0..3 {
            resolve(&space, &range, va(0x40_0000 + page * 0x1000), WRITE).unwrap();
        }
        assert_eq!(pool.free_count(), baseline - 1 - 3 - 3);
    }
    assert_eq!(pool.free_count(), baseline);
}
