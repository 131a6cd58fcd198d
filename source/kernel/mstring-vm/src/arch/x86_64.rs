// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! x86_64 translation-cache maintenance.

use crate::diag::stats::{bump, stats};
use crate::types::VirtAddr;

/// Drops the TLB entry caching the translation of `va` on this CPU.
#[inline]
pub fn flush_tlb_entry(va: VirtAddr) {
    bump(&stats().tlb_flushes);
    invlpg(va);
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline(always)]
fn invlpg(va: VirtAddr) {
    // SAFETY: invlpg only drops a cached translation; it has no memory effects.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.raw(), options(nostack, preserves_flags));
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[inline(always)]
fn invlpg(_va: VirtAddr) {}
