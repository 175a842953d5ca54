//! Error types for stream and device operations.
//!
//! Two kinds of failure are kept apart:
//!
//! - [`ErrorCode`] is the closed status taxonomy reported by the data plane
//!   (timeouts, overflows, unsupported requests). These travel inside a
//!   [`StreamResult`](crate::StreamResult) and the expected reaction is to log
//!   and keep looping.
//! - [`SdrError`] covers caller mistakes and setup-time misconfiguration.
//!   These are returned as `Err` and are never retried by the core.

use crate::format::StreamFormat;
use crate::types::Direction;

/// Result type for SDR operations
pub type SdrResult<T> = Result<T, SdrError>;

/// Status codes reported by stream I/O.
///
/// The integer values are stable and match the conventional driver ABI,
/// so they can be passed across process or language boundaries unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success
    #[default]
    None = 0,
    /// The call timed out without making progress
    Timeout = -1,
    /// Non-specific stream or transport fault
    StreamError = -2,
    /// Data corruption, e.g. a malformed packet from hardware
    Corruption = -3,
    /// Receive overrun, samples were lost
    Overflow = -4,
    /// Operation, format or flag combination not implemented by the driver
    NotSupported = -5,
    /// A timed packet was late or too early to process
    TimeError = -6,
    /// Transmit underrun, hardware was starved
    Underflow = -7,
    /// A bounded burst or finite source has been exhausted
    EndOfStream = -8,
}

impl ErrorCode {
    /// All codes, in numeric order from `None` downwards.
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::None,
        ErrorCode::Timeout,
        ErrorCode::StreamError,
        ErrorCode::Corruption,
        ErrorCode::Overflow,
        ErrorCode::NotSupported,
        ErrorCode::TimeError,
        ErrorCode::Underflow,
        ErrorCode::EndOfStream,
    ];

    /// Integer code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a status from its integer code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Short upper-case name, `"UNKNOWN"` for codes outside the taxonomy.
    pub fn code_to_str(code: i32) -> &'static str {
        Self::from_code(code).map(Self::as_str).unwrap_or("UNKNOWN")
    }

    /// Short upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::None => "NONE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::Corruption => "CORRUPTION",
            ErrorCode::Overflow => "OVERFLOW",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::TimeError => "TIME_ERROR",
            ErrorCode::Underflow => "UNDERFLOW",
            ErrorCode::EndOfStream => "END_OF_STREAM",
        }
    }

    /// True for [`ErrorCode::None`].
    #[inline]
    pub fn is_ok(self) -> bool {
        self == ErrorCode::None
    }

    /// Convert into a `Result`, mapping `None` to `Ok(())`.
    pub fn into_result(self) -> Result<(), ErrorCode> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buffer validation failures, in the order they are checked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("No buffers supplied")]
    NoBuffers,

    #[error("Stream is configured for {expected} channel(s), cannot accept {actual} buffer(s)")]
    ChannelCountMismatch { expected: usize, actual: usize },

    #[error("Stream format {format} is incompatible with buffer element {element}")]
    FormatMismatch {
        format: StreamFormat,
        element: StreamFormat,
    },

    #[error("All channel buffers must be the same length")]
    LengthMismatch,

    #[error("Interleaved complex buffers must have an even length, got {len}")]
    OddLength { len: usize },

    #[error("Raw buffer of {len} bytes is not a whole number of {size}-byte elements")]
    PartialElement { len: usize, size: usize },
}

/// Errors that can occur during SDR operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SdrError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    #[error("Unsupported format {format} for {direction} channel {channel}")]
    UnsupportedFormat {
        format: StreamFormat,
        direction: Direction,
        channel: usize,
    },

    #[error("Invalid channel {channel}: device has {available} {direction} channel(s)")]
    InvalidChannel {
        channel: usize,
        available: usize,
        direction: Direction,
    },

    #[error("{direction} channel {channel} is already owned by another stream")]
    ChannelInUse { direction: Direction, channel: usize },

    #[error("Operation not valid on a {0} stream")]
    WrongDirection(Direction),

    #[error("Stream is already active")]
    AlreadyActive,

    #[error("Stream is not active")]
    NotActive,

    #[error("Stream is already closed")]
    AlreadyClosed,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Buffer validation failed: {0}")]
    Buffer(#[from] BufferError),

    #[error("Device reported {0}")]
    Status(ErrorCode),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Log handler failed: {0}")]
    LogHandler(String),
}

impl From<ErrorCode> for SdrError {
    fn from(code: ErrorCode) -> Self {
        SdrError::Status(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::None.code(), 0);
        assert_eq!(ErrorCode::Timeout.code(), -1);
        assert_eq!(ErrorCode::Underflow.code(), -7);
        assert_eq!(ErrorCode::EndOfStream.code(), -8);
    }

    #[test]
    fn test_error_code_lookup() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(-42), None);
        assert_eq!(ErrorCode::code_to_str(-4), "OVERFLOW");
        assert_eq!(ErrorCode::code_to_str(-42), "UNKNOWN");
    }

    #[test]
    fn test_into_result() {
        assert_eq!(ErrorCode::None.into_result(), Ok(()));
        assert_eq!(ErrorCode::Timeout.into_result(), Err(ErrorCode::Timeout));
    }

    #[test]
    fn test_buffer_error_converts() {
        let err: SdrError = BufferError::NoBuffers.into();
        assert_eq!(err, SdrError::Buffer(BufferError::NoBuffers));
        assert!(err.to_string().contains("No buffers"));
    }
}
