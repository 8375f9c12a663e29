//! Pluggable structured log sink. See SPEC_FULL.md §4.2.

use std::collections::BTreeMap;
use std::fmt;

/// Log severity. Ordered the way `tracing::Level` is, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A normalized structured error: `{name, message, stack?}`.
#[derive(Debug, Clone)]
pub struct LoggedError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl LoggedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl<E: std::error::Error> From<&E> for LoggedError {
    fn from(err: &E) -> Self {
        let name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        LoggedError::new(name, err.to_string())
    }
}

/// A flat set of structured context fields attached to a log entry.
pub type LogContext = BTreeMap<String, String>;

/// Operation `log(level, source, message, context?, error?)`. Implementations
/// must not panic; callers treat logging as best-effort. A no-op default
/// implementation always exists.
pub trait Logger: Send + Sync {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        context: Option<&LogContext>,
        error: Option<&LoggedError>,
    );

    fn debug(&self, source: &str, message: &str) {
        self.log(LogLevel::Debug, source, message, None, None);
    }

    fn info(&self, source: &str, message: &str) {
        self.log(LogLevel::Info, source, message, None, None);
    }

    fn warn(&self, source: &str, message: &str) {
        self.log(LogLevel::Warn, source, message, None, None);
    }

    fn error(&self, source: &str, message: &str, error: Option<&LoggedError>) {
        self.log(LogLevel::Error, source, message, None, error);
    }
}

/// The required default: discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(
        &self,
        _level: LogLevel,
        _source: &str,
        _message: &str,
        _context: Option<&LogContext>,
        _error: Option<&LoggedError>,
    ) {
    }
}

/// Forwards to the `tracing` crate, the teacher's logging backend throughout
/// every crate. Context fields and the normalized error are flattened into
/// the tracing event as key/value fields rather than interpolated strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: &str,
        context: Option<&LogContext>,
        error: Option<&LoggedError>,
    ) {
        let ctx = context
            .map(|c| {
                c.iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let err = error
            .map(|e| format!(" error.name={} error.message={}", e.name, e.message))
            .unwrap_or_default();
        match level {
            LogLevel::Debug => tracing::debug!(source, "{message} {ctx}{err}"),
            LogLevel::Info => tracing::info!(source, "{message} {ctx}{err}"),
            LogLevel::Warn => tracing::warn!(source, "{message} {ctx}{err}"),
            LogLevel::Error => tracing::error!(source, "{message} {ctx}{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingLogger {
        entries: Mutex<Vec<(LogLevel, String, String)>>,
    }

    impl Logger for CapturingLogger {
        fn log(
            &self,
            level: LogLevel,
            source: &str,
            message: &str,
            _context: Option<&LogContext>,
            _error: Option<&LoggedError>,
        ) {
            self.entries
                .lock()
                .unwrap()
                .push((level, source.to_string(), message.to_string()));
        }
    }

    #[test]
    fn noop_logger_never_panics() {
        let logger = NoopLogger;
        logger.error("test.source", "boom", Some(&LoggedError::new("E", "bad")));
    }

    #[test]
    fn capturing_logger_records_level() {
        let logger = CapturingLogger {
            entries: Mutex::new(Vec::new()),
        };
        logger.warn("test.source", "careful");
        let entries = logger.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, LogLevel::Warn);
    }

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
