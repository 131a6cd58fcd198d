// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time configuration of the VM core.

use log::LevelFilter;

use crate::diag::log::{default_level, Console};
use crate::memobj::registry::DEFAULT_MAX_MEMORY_OBJECTS;

/// Parameters consumed by [`crate::init`].
#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    /// Upper bound on simultaneously live memory objects (id space).
    pub max_memory_objects: usize,
    /// Maximum log level enabled at boot.
    pub log_level: LevelFilter,
    /// Console receiving log lines; `None` leaves the log facade untouched.
    pub console: Option<Console>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_memory_objects: DEFAULT_MAX_MEMORY_OBJECTS,
            log_level: default_level(),
            console: None,
        }
    }
}

impl VmConfig {
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_max_memory_objects(mut self, max: usize) -> Self {
        self.max_memory_objects = max;
        self
    }
}
