// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics for the VM core (log backend, counters)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: log::init, stats::stats()
//! DEPENDS_ON: log facade, core atomics

pub mod log;
pub mod stats;
