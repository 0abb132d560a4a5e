//! `log` crate backend over the serial console.
//!
//! Grounded on the teacher pack's serial/framebuffer `CombinedLogger`, but
//! narrowed to a single sink: under Limine the serial UART is programmable
//! the moment Rust code runs, so there is no pre-serial buffering stage and
//! no framebuffer console to hand off to.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::serial::SERIAL1;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        x86_64::instructions::interrupts::without_interrupts(|| {
            write_record(&mut *SERIAL1.lock(), record);
        });
    }

    fn flush(&self) {}
}

fn write_record(sink: &mut impl Write, record: &Record) {
    let _ = writeln!(
        sink,
        "[{:>5} {}] {}",
        record.level(),
        record.target(),
        record.args()
    );
}

/// Installs the serial logger as the global `log` backend.
///
/// Must be called exactly once, before any other kernel subsystem runs, so
/// that `mm::init` and every later stage can report progress uniformly.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .expect("logger::init called more than once");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn record_formats_level_target_and_args() {
        let mut buf = alloc::string::String::new();
        let record = Record::builder()
            .level(Level::Info)
            .target("mm::buddy")
            .args(format_args!("{} pages freed", 4))
            .build();
        write_record(&mut buf, &record);
        assert_eq!(buf, "[ INFO mm::buddy] 4 pages freed\n");
    }
}
