use std::cell::RefCell;
use std::fmt;

/// Where progress and warnings go. Handed explicitly to everything that reports.
pub trait LogSink {
    /// Progress lines, dropped in quiet mode.
    fn info(&self, args: fmt::Arguments<'_>);
    /// Always emitted.
    fn warn(&self, args: fmt::Arguments<'_>);
}

#[macro_export]
macro_rules! sink_info {
    ($sink:expr, $($arg:tt)+) => {
        $crate::log_sink::LogSink::info($sink, ::core::format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! sink_warn {
    ($sink:expr, $($arg:tt)+) => {
        $crate::log_sink::LogSink::warn($sink, ::core::format_args!($($arg)+))
    };
}

/// Forwards to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeSink {
    quiet: bool,
}

impl FacadeSink {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl LogSink for FacadeSink {
    fn info(&self, args: fmt::Arguments<'_>) {
        if !self.quiet {
            log::info!("{args}");
        }
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!("{args}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
}

/// Keeps every line in memory, for inspection by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: RefCell<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|(_, l)| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn info(&self, args: fmt::Arguments<'_>) {
        self.lines.borrow_mut().push((Level::Info, args.to_string()));
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.lines.borrow_mut().push((Level::Warn, args.to_string()));
    }
}
