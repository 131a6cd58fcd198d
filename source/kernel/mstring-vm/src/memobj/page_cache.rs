// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-cache nature. Only teardown is implemented; file-backed paging is
//! provided by proxy objects.

use super::{MemObjOps, MemObject};
use crate::error::VmResult;

pub(super) struct PageCacheOps;

impl MemObjOps for PageCacheOps {
    fn cleanup(&self, obj: &MemObject) -> VmResult<()> {
        log::trace!(target: "memobj", "MEMOBJ: page cache {} released", obj.id());
        Ok(())
    }
}
