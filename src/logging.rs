//! Diagnostic logging: the `log` crate facade for normal developer-facing
//! trace, plus an engine-owned sink for the embedding host (§6
//! `set_log_callback`) — the same call site feeds both.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

pub type LogSink = Box<dyn FnMut(LogLevel, &str) + Send>;

/// Forwards one diagnostic line to both the process-wide `log` logger and,
/// if registered, the caller's own sink. Absence of a sink silently drops
/// the second destination (§6).
pub fn emit(sink: &Mutex<Option<LogSink>>, level: LogLevel, message: &str) {
    log::log!(target: "dbgengine", level.into(), "{message}");
    if let Some(cb) = sink.lock().as_mut() {
        cb(level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_receives_forwarded_message() {
        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let sink: Mutex<Option<LogSink>> = Mutex::new(Some(Box::new(move |level, msg| {
            *seen_clone.lock() = Some((level, msg.to_string()));
        })));
        emit(&sink, LogLevel::Warn, "stop-all retry exhausted");
        let recorded = seen.lock().take().expect("sink should have been called");
        assert_eq!(recorded.0, LogLevel::Warn);
        assert_eq!(recorded.1, "stop-all retry exhausted");
    }

    #[test]
    fn absent_sink_does_not_panic() {
        let sink: Mutex<Option<LogSink>> = Mutex::new(None);
        emit(&sink, LogLevel::Debug, "no sink registered");
    }
}
