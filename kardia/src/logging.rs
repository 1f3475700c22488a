pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal logger for binaries. Library components default to a
/// `Discard` root when no parent logger is supplied.
pub fn term(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("Error building terminal logger")
}

/// A logger that drops everything. Used as the default root for components
/// constructed without a parent logger and in tests.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child logger.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => null(),
    }
}
