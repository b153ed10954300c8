//! Logger backend for the `log` facade
//!
//! Routes `log::{error, warn, info, ...}!` records to the console byte
//! sink as severity-prefixed, ANSI-color-coded lines. The sink is
//! registered once at boot, before any other subsystem comes up.

use crate::core::sync::SpinLock;
use crate::utils::console::{ByteSink, SinkWriter};
use core::fmt::Write;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger {
    sink: SpinLock<Option<&'static dyn ByteSink>>,
}

static LOGGER: ConsoleLogger = ConsoleLogger {
    sink: SpinLock::new(None),
};

impl ConsoleLogger {
    fn level_filter() -> LevelFilter {
        if cfg!(feature = "verbose") {
            LevelFilter::Trace
        } else if cfg!(feature = "debug") {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Self::level_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let guard = self.sink.lock();
        if let Some(sink) = *guard {
            emit_line(sink, record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Register the console sink and install the logger. Called once on the
/// boot CPU; later calls only swap the sink.
pub fn init(sink: &'static dyn ByteSink) {
    *LOGGER.sink.lock() = Some(sink);
    // Err means a logger is already installed, which is fine.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(ConsoleLogger::level_filter());
}

fn severity(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::Error => ("\x1b[31m", "ERROR"),
        Level::Warn => ("\x1b[33m", " WARN"),
        Level::Info => ("\x1b[32m", " INFO"),
        Level::Debug => ("\x1b[36m", "DEBUG"),
        Level::Trace => ("\x1b[90m", "TRACE"),
    }
}

fn emit_line(sink: &dyn ByteSink, level: Level, args: &core::fmt::Arguments) {
    let (color, tag) = severity(level);
    let mut writer = SinkWriter(sink);
    let _ = write!(writer, "{}[{}]\x1b[0m ", color, tag);
    let _ = writer.write_fmt(*args);
    let _ = writer.write_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<u8>>);

    impl ByteSink for Capture {
        fn putc(&self, byte: u8) {
            self.0.lock().unwrap().push(byte);
        }
    }

    #[test]
    fn lines_carry_severity_and_color() {
        let sink = Capture(Mutex::new(Vec::new()));
        emit_line(&sink, Level::Warn, &format_args!("pmm low: {} pages", 3));
        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "\x1b[33m[ WARN]\x1b[0m pmm low: 3 pages\r\n");
    }

    #[test]
    fn error_is_red() {
        let sink = Capture(Mutex::new(Vec::new()));
        emit_line(&sink, Level::Error, &format_args!("halt"));
        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(text.starts_with("\x1b[31m[ERROR]"));
    }
}
