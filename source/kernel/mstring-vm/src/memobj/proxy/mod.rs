// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Proxy nature: pages provided by an out-of-kernel pager over IPC
//! OWNERS: @kernel-mm-team
//! PUBLIC API: wire::*, ProxyOps (through MemObject)
//! DEPENDS_ON: ipc::Channel, memobj::Backend, mm, fault::Fault
//! INVARIANTS:
//!   - No page-table lock is held across a round-trip
//!   - A reply address is trusted only after it resolves to this object, at the
//!     requested offset, in the server's own page tables
//!   - Pages are shared zero-copy between server and client

pub mod wire;

use alloc::sync::Arc;

use self::wire::Request;
use super::{MemObjOps, MemObject, ServerTask};
use crate::diag::stats::{bump, stats};
use crate::error::{ProtocolFault, VmError, VmResult};
use crate::fault::{Fault, FaultState};
use crate::ipc::{Channel, Message};
use crate::mm::{AddressSpace, VmRange, PAGE_SIZE};
use crate::types::{PageIndex, VirtAddr};

pub(super) struct ProxyOps;

/// Live server plus a pinned channel for one round-trip.
struct Session {
    server: Arc<dyn ServerTask>,
    channel: Arc<dyn Channel>,
    tag: u64,
}

impl Session {
    fn open(obj: &MemObject) -> VmResult<Self> {
        let backend = obj.backend().ok_or(VmError::NotSupported)?;
        let server = backend.server().ok_or_else(|| {
            log::debug!(target: "proxy", "PROXY: server of {} is gone", obj.id());
            VmError::Fault
        })?;
        Ok(Self { server, channel: backend.channel(), tag: backend.tag() })
    }

    fn call(&self, request: Request) -> VmResult<Message> {
        let reply = self.channel.call(request.encode(self.server.task_id()))?;
        Ok(reply)
    }

    fn call_status(&self, request: Request) -> VmResult<i64> {
        let reply = self.call(request)?;
        Ok(wire::decode_status_reply(&reply, request.ty())?)
    }

    fn is_server_space(&self, space: &AddressSpace) -> bool {
        self.server.address_space().id() == space.id()
    }
}

impl MemObjOps for ProxyOps {
    fn handle_page_fault(&self, obj: &MemObject, fault: &Fault<'_>) -> VmResult<()> {
        if fault.state() == FaultState::ProtectionOnly {
            let mut table = fault.space.lock_table();
            if let Some(frame) = table.translate(fault.page()) {
                return table.map_one(fault.page(), frame, fault.range.attrs);
            }
        }
        let session = Session::open(obj)?;
        if session.is_server_space(fault.space) {
            return server_local_page(obj, fault);
        }

        let request = Request::PageFault {
            id: obj.id(),
            mask: fault.mask.bits(),
            tag: session.tag,
            offset: fault.offset(),
        };
        let reply = session.call(request)?;
        let pinned = pin_server_frame(obj, &*session.server, &reply, fault.offset());
        let frame = pinned.inspect_err(|err| {
            bump(&stats().protocol_faults);
            log::warn!(
                target: "proxy",
                "PROXY: rejected reply from task {} for {} offset {}: {}",
                session.server.task_id().as_raw(),
                obj.id(),
                fault.offset(),
                err
            );
        })?;
        drop(session);

        let result = install_shared(obj, fault, frame);
        fault.space.frames().put_frame(frame);
        if result.is_ok() {
            bump(&stats().proxy_faults);
        }
        result
    }

    fn depopulate_pages(
        &self,
        obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        let session = Session::open(obj).ok();
        let notify = session.as_ref().is_some_and(|s| !s.is_server_space(space));
        for index in 0..pages {
            let page = va.checked_add_pages(index).ok_or(VmError::InvalidArgs)?;
            if !range.contains(page) {
                return Err(VmError::InvalidArgs);
            }
            {
                let mut table = space.lock_table();
                let Some(frame) = table.translate(page) else {
                    continue;
                };
                space.rmap().unregister(frame, space.id(), page);
                table.unmap(page, 1, true)?;
            }
            let Some(session) = session.as_ref().filter(|_| notify) else {
                continue;
            };
            let request = Request::Depopulate {
                id: obj.id(),
                tag: session.tag,
                offset: range.object_offset(page),
                len: PAGE_SIZE as u64,
            };
            match session.call_status(request) {
                Ok(0) => {}
                Ok(status) => log::warn!(
                    target: "proxy",
                    "PROXY: depopulate {} offset {} status {}",
                    obj.id(),
                    range.object_offset(page),
                    status
                ),
                Err(err) => {
                    log::warn!(target: "proxy", "PROXY: depopulate {} failed: {}", obj.id(), err)
                }
            }
        }
        Ok(())
    }

    fn msync(
        &self,
        obj: &MemObject,
        space: &AddressSpace,
        range: &VmRange,
        va: VirtAddr,
        pages: u64,
    ) -> VmResult<()> {
        let session = Session::open(obj)?;
        if session.is_server_space(space) {
            return Ok(());
        }
        for index in 0..pages {
            let page = va.checked_add_pages(index).ok_or(VmError::InvalidArgs)?;
            if !range.contains(page) {
                return Err(VmError::InvalidArgs);
            }
            if space.translate(page).is_none() {
                continue;
            }
            let request = Request::Msync {
                id: obj.id(),
                tag: session.tag,
                offset: range.object_offset(page),
                len: PAGE_SIZE as u64,
            };
            match session.call_status(request)? {
                0 => {}
                status => return Err(VmError::Backend { status }),
            }
        }
        Ok(())
    }

    fn mmap_check(&self, obj: &MemObject, offset: u64, pages: u64) -> VmResult<()> {
        let session = Session::open(obj)?;
        let request = Request::MmapCheck { id: obj.id(), tag: session.tag, offset, pages };
        let status = session.call_status(request)?;
        if status != 0 {
            log::debug!(target: "proxy", "PROXY: mmap of {} denied, status {}", obj.id(), status);
            return Err(VmError::PermissionDenied);
        }
        Ok(())
    }

    fn unmap_ack(&self, obj: &MemObject) -> VmResult<()> {
        let session = Session::open(obj)?;
        session.channel.notify(Request::UnmapAck.encode(session.server.task_id()))?;
        Ok(())
    }

    fn cleanup(&self, obj: &MemObject) -> VmResult<()> {
        if let Err(err) = self.unmap_ack(obj) {
            log::debug!(
                target: "proxy",
                "PROXY: final unmap ack for {} not delivered: {}",
                obj.id(),
                err
            );
        }
        Ok(())
    }
}

/// Validates a PAGE_FAULT reply and pins the frame the server named.
fn pin_server_frame(
    obj: &MemObject,
    server: &dyn ServerTask,
    reply: &Message,
    offset: u64,
) -> VmResult<PageIndex> {
    let raw = wire::decode_addr_reply(reply)?;
    let addr = VirtAddr::page_aligned(raw).ok_or(ProtocolFault::Malformed)?;
    let range = server.find_range(addr).ok_or(ProtocolFault::NoRange)?;
    if range.memobj.id() != obj.id() {
        return Err(ProtocolFault::ForeignObject.into());
    }
    if range.object_offset(addr) != offset {
        return Err(ProtocolFault::OffsetMismatch.into());
    }
    let space = server.address_space();
    let table = space.lock_table();
    let frame = table.translate(addr).ok_or(ProtocolFault::NotMapped)?;
    space.frames().frame(frame).pin();
    Ok(frame)
}

/// Maps `frame` into the faulting space unless someone got there first.
fn install_shared(obj: &MemObject, fault: &Fault<'_>, frame: PageIndex) -> VmResult<()> {
    let space = fault.space;
    let page = fault.page();
    let mut table = space.lock_table();
    if table.translate(page).is_some() {
        bump(&stats().races);
        return Ok(());
    }
    table.map_one(page, frame, fault.range.attrs)?;
    if let Err(err) = space.rmap().register_shared(frame, space.id(), page, obj.id()) {
        table.unmap(page, 1, true)?;
        return Err(err);
    }
    Ok(())
}

/// Fault taken by the server on its own mapping: hand out a fresh zero page.
fn server_local_page(obj: &MemObject, fault: &Fault<'_>) -> VmResult<()> {
    let space = fault.space;
    let frames = space.frames();
    let page = fault.page();
    let frame = frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
    frames.frame(frame).set_offset(fault.offset());
    frames.frame(frame).pin();
    let result = install_shared(obj, fault, frame);
    frames.put_frame(frame);
    if result.is_ok() {
        bump(&stats().zero_fills);
        log::trace!(
            target: "proxy",
            "PROXY: server zero page {} for {} at {}",
            frame,
            obj.id(),
            page
        );
    }
    result
}
