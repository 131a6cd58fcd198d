// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Global fault and page-table counters.

use core::sync::atomic::{AtomicU64, Ordering};

static STATS: VmStats = VmStats::new();

/// Monotonic counters, updated with relaxed ordering.
pub struct VmStats {
    /// Faults dispatched to a memory object.
    pub faults: AtomicU64,
    /// Zero-filled anonymous pages installed.
    pub zero_fills: AtomicU64,
    /// Protection faults resolved by granting write on a private page.
    pub write_grants: AtomicU64,
    /// Copy-on-write duplications.
    pub cow_copies: AtomicU64,
    /// Pages installed from a proxy backend.
    pub proxy_faults: AtomicU64,
    /// Backend replies rejected as protocol faults.
    pub protocol_faults: AtomicU64,
    /// Faults found already resolved by another thread.
    pub races: AtomicU64,
    /// Faults that returned an error.
    pub failures: AtomicU64,
    /// Single-entry TLB invalidations issued.
    pub tlb_flushes: AtomicU64,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            write_grants: AtomicU64::new(0),
            cow_copies: AtomicU64::new(0),
            proxy_faults: AtomicU64::new(0),
            protocol_faults: AtomicU64::new(0),
            races: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            tlb_flushes: AtomicU64::new(0),
        }
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Global counters.
pub fn stats() -> &'static VmStats {
    &STATS
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
