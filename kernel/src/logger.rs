//! `log` facade wiring.
//!
//! Drivers and the loader log through the `log` crate; this sink forwards
//! records to the kernel console with a `[LEVEL] target:` prefix.

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Safe to call more than once; later calls
/// are no-ops (the `log` crate rejects a second logger).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Raise or lower the global log verbosity.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
