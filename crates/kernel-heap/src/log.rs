//! Level-tagged kernel log.
//!
//! Messages go to the sink installed with [`set_sink`] and are dropped until
//! one is installed. Sinks run inside the `GlobalAlloc` path and must not
//! allocate.

use core::fmt::{self, Display as _};

use ansi_term::{Color, WithFg};
use spin::Once;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*));
    };
}

macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*);
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*);
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*);
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*);
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*);
    };
}

/// Destination of log lines, typically the boot console.
pub trait LogSink: Sync {
    /// Writes one formatted line, without the trailing newline.
    fn write_line(&self, line: fmt::Arguments<'_>);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Installs the log sink.
///
/// Returns `false` if a sink was already installed; the first one stays.
#[must_use]
pub fn set_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

pub fn log(level: LogLevel, message: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink.write_line(format_args!("{} {}", LevelFormat(level), message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

struct LevelFormat(LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => Color::Magenta,
            LogLevel::Debug => Color::Blue,
            LogLevel::Info => Color::Green,
            LogLevel::Warn => Color::Yellow,
            LogLevel::Error => Color::Red,
        };
        let msg = match self.0 {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
        };
        WithFg::new(color, msg).fmt(f)
    }
}
