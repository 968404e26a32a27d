// provides the kernel logger behind the log crate macros
extern crate log;
extern crate spin;

use core::fmt;

use lazy_static::lazy_static;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Where formatted log lines end up, a UART or a console on the host kernel.
pub trait LogSink: Sync {
    fn write_line(&self, line: fmt::Arguments);
}

// a logger that implements kernel logging functionalities
pub struct KernelLogger;

lazy_static! {
    static ref SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);
}

impl log::Log for KernelLogger {
    fn enabled(&self, meta: &Metadata) -> bool {
        meta.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // copy the sink out so a sink that logs cannot deadlock us
        let sink = *SINK.lock();
        if let Some(sink) = sink {
            sink.write_line(format_args!(
                "{:20} {:5} {}",
                record.target(),
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static KERNEL_LOGGER: KernelLogger = KernelLogger;

pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

pub fn init(sink: &'static dyn LogSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    set_sink(sink);
    log::set_logger(&KERNEL_LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
