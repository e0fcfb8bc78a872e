// Tue Jan 13 2026 - Alex

use colored::*;
use log::{Level, LevelFilter, Log, Metadata, Record};

pub struct ColoredLogger {
    level: LevelFilter,
}

impl ColoredLogger {
    fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    fn format_level(&self, level: Level) -> ColoredString {
        match level {
            Level::Error => "error".red().bold(),
            Level::Warn => "warning".yellow().bold(),
            Level::Info => "info".green().bold(),
            Level::Debug => "debug".blue().bold(),
            Level::Trace => "trace".magenta().bold(),
        }
    }
}

impl Log for ColoredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}: {}", self.format_level(record.level()), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the stderr logger.  `--no-warnings` suppresses warnings only;
/// `--debug` enables per-instruction match tracing.
pub fn init(debug: bool, no_warnings: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else if no_warnings {
        LevelFilter::Error
    } else {
        LevelFilter::Warn
    };
    let logger = Box::new(ColoredLogger::new(level));
    log::set_boxed_logger(logger).ok();
    log::set_max_level(level);
}
