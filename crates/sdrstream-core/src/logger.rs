//! Process-wide log slot.
//!
//! Drivers and applications report messages with SDR severities through
//! [`log`]. Messages above the threshold set by [`set_log_level`] are dropped
//! before any handler runs. A handler installed with [`register_log_handler`]
//! receives everything else; without one, messages go to `tracing`.
//!
//! Streaming status indicators ([`LogLevel::Ssi`]) are single characters such
//! as `"O"` (overflow) or `"U"` (underflow). They are never filtered.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{SdrError, SdrResult};

/// Severity of a log message. Lower values are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Fatal = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
    Trace = 8,
    /// Streaming status indicator
    Ssi = 9,
}

impl LogLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => LogLevel::Fatal,
            2 => LogLevel::Critical,
            3 => LogLevel::Error,
            4 => LogLevel::Warning,
            5 => LogLevel::Notice,
            6 => LogLevel::Info,
            7 => LogLevel::Debug,
            8 => LogLevel::Trace,
            9 => LogLevel::Ssi,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
            LogLevel::Ssi => "SSI",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(LogLevel, &str) -> Result<(), HandlerError> + Send + Sync>;

static HANDLER: RwLock<Option<Handler>> = RwLock::new(None);
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Install `handler`, replacing any previous one.
pub fn register_log_handler<F>(handler: F)
where
    F: Fn(LogLevel, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let mut slot = HANDLER.write().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(Arc::new(handler));
}

/// Remove the installed handler, restoring forwarding to `tracing`.
pub fn unregister_log_handler() {
    let mut slot = HANDLER.write().unwrap_or_else(PoisonError::into_inner);
    *slot = None;
}

/// Set the least severe level that still gets through.
pub fn set_log_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    LogLevel::from_u8(THRESHOLD.load(Ordering::Relaxed)).unwrap_or(LogLevel::Info)
}

/// Log a message.
///
/// A failing handler's error is returned as [`SdrError::LogHandler`].
pub fn log(level: LogLevel, message: &str) -> SdrResult<()> {
    if level != LogLevel::Ssi && level > log_level() {
        return Ok(());
    }
    // Clone out of the lock so a handler may itself re-register.
    let handler = HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match handler {
        Some(handler) => handler(level, message).map_err(|e| SdrError::LogHandler(e.to_string())),
        None => {
            forward_to_tracing(level, message);
            Ok(())
        }
    }
}

/// Log preformatted arguments, see [`sdr_log!`](crate::sdr_log).
pub fn logf(level: LogLevel, args: fmt::Arguments<'_>) -> SdrResult<()> {
    match args.as_str() {
        Some(s) => log(level, s),
        None => log(level, &args.to_string()),
    }
}

fn forward_to_tracing(level: LogLevel, message: &str) {
    match level {
        LogLevel::Fatal | LogLevel::Critical | LogLevel::Error => {
            tracing::error!(severity = level.as_str(), "{}", message)
        }
        LogLevel::Warning => tracing::warn!("{}", message),
        LogLevel::Notice | LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Trace => tracing::trace!("{}", message),
        LogLevel::Ssi => tracing::warn!(target: "sdrstream::ssi", "{}", message),
    }
}

/// Format and log a message through the process-wide slot.
///
/// ```rust,ignore
/// sdr_log!(LogLevel::Info, "opened {} at {} Hz", name, rate)?;
/// ```
#[macro_export]
macro_rules! sdr_log {
    ($level:expr, $($arg:tt)+) => {
        $crate::logger::logf($level, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The slot is process-wide; serialize tests that touch it.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn capture() -> Arc<Mutex<Vec<(LogLevel, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        register_log_handler(move |level, msg| {
            sink.lock().unwrap().push((level, msg.to_string()));
            Ok(())
        });
        seen
    }

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Fatal < LogLevel::Critical);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(9), Some(LogLevel::Ssi));
        assert_eq!(LogLevel::from_u8(0), None);
    }

    #[test]
    fn test_threshold_filters_before_handler() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        set_log_level(LogLevel::Notice);
        assert_eq!(log_level(), LogLevel::Notice);
        let seen = capture();

        log(LogLevel::Critical, "message").unwrap();
        sdr_log!(LogLevel::Critical, "message: {} {}", 1351, "foobar").unwrap();
        log(LogLevel::Info, "dropped").unwrap();
        log(LogLevel::Ssi, "O").unwrap();

        unregister_log_handler();
        set_log_level(LogLevel::Info);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (LogLevel::Critical, "message".to_string()),
                (LogLevel::Critical, "message: 1351 foobar".to_string()),
                (LogLevel::Ssi, "O".to_string()),
            ]
        );
    }

    #[test]
    fn test_register_replaces_and_unregister_restores() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let first = capture();
        let second = capture();
        log(LogLevel::Error, "to second").unwrap();
        unregister_log_handler();
        log(LogLevel::Error, "to tracing").unwrap();

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_handler_error_propagates() {
        let _guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        register_log_handler(|_, _| Err("sink full".into()));
        let result = log(LogLevel::Warning, "boom");
        unregister_log_handler();
        assert_eq!(result, Err(SdrError::LogHandler("sink full".to_string())));
    }
}
