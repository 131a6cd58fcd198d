// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory core of the x86_64 kernel
//! OWNERS: @kernel-mm-team
//! PUBLIC API: init(config), mm, memobj, fault, syscall, ipc, diag
//! DEPENDS_ON: FramePool, ReverseMap, RangeLookup, Channel and CallerTask implementations from the rest of the kernel
//! INVARIANTS: No page-table lock across IPC; all-or-nothing page-table edits; errors propagate, invariant violations panic

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod diag;
pub mod error;
pub mod fault;
pub mod ipc;
pub mod memobj;
pub mod mm;
pub mod syscall;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::VmConfig;
pub use error::{VmError, VmResult};

/// Brings up the VM core: logger, memory-object registry and the generic object.
///
/// Safe to call more than once; only the first call sizes the registry.
pub fn init(config: &VmConfig) -> VmResult<()> {
    if let Some(console) = config.console {
        if diag::log::init(console, config.log_level).is_err() {
            // Another logger owns the facade; keep using it.
            log::set_max_level(config.log_level);
        }
    }
    let registry = memobj::registry::init_registry(config.max_memory_objects);
    let generic = memobj::generic_object()?;
    log::info!(
        target: "memobj",
        "MEMOBJ: ready, generic id {} capacity {} live {}",
        generic.id(),
        config.max_memory_objects,
        registry.len()
    );
    Ok(())
}
