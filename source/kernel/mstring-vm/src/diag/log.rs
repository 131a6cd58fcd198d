// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel backend for the `log` facade with severity gating
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Line formatting unit-tested (host)
//! PUBLIC API: init(console, level), Console, default_level()
//! DEPENDS_ON: log, spin::Once
//! INVARIANTS: Debug/Trace only in debug builds by default; single-line emission

use core::fmt::{self, Arguments, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Console sink receiving one formatted log line at a time.
pub type Console = fn(Arguments<'_>);

struct KernelLogger {
    console: spin::Once<Console>,
}

static LOGGER: KernelLogger = KernelLogger { console: spin::Once::new() };
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = self.console.get() {
            console(format_args!("{}", Line(record)));
        }
    }

    fn flush(&self) {}
}

/// `[LEVEL target] message`
struct Line<'a, 'r>(&'a Record<'r>);

impl fmt::Display for Line<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] ", self.0.level(), self.0.target())?;
        f.write_fmt(*self.0.args())?;
        f.write_char('\n')
    }
}

/// Level used when the configuration does not override it.
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs the kernel logger writing to `console`.
///
/// The first console wins; later calls only adjust the level.
pub fn init(console: Console, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.console.call_once(|| console);
    log::set_max_level(level);
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }
    log::set_logger(&LOGGER)?;
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}
