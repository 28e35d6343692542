//! Logging infrastructure for sdspi
//!
//! This module provides logging via the `log` crate. Output goes to a
//! [`LogSink`] supplied by the host (typically a debug serial port), one
//! line per record.
//!
//! ANSI colours on level names are disabled by default. Enable them with
//! the `log-color` feature flag.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU32, Ordering};
use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Destination for formatted log text
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

/// Record counter, printed in front of every line
static SEQUENCE: AtomicU32 = AtomicU32::new(0);

static SINK: Once<&'static dyn LogSink> = Once::new();

struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

fn level_label(level: Level) -> &'static str {
    #[cfg(feature = "log-color")]
    {
        match level {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33mWARN\x1b[0m ",
            Level::Info => "\x1b[32mINFO\x1b[0m ",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        }
    }
    #[cfg(not(feature = "log-color"))]
    {
        match level {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

fn write_record<W: Write>(out: &mut W, seq: u32, record: &Record) -> fmt::Result {
    writeln!(
        out,
        "[{:>8}] [{}] {}: {}",
        seq,
        level_label(record.level()),
        record.target(),
        record.args()
    )
}

/// Logger forwarding to the host sink
struct TraceLogger;

impl log::Log for TraceLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(sink) = SINK.get() {
            let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
            let _ = write_record(&mut SinkWriter(*sink), seq, record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: TraceLogger = TraceLogger;

/// Initialize the logging subsystem
///
/// Only the first sink is kept. Later calls just change the level, so a
/// host that re-attaches the unit can call this unconditionally.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) {
    SINK.call_once(|| sink);

    // Fails only if a logger is already installed, which is fine
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
