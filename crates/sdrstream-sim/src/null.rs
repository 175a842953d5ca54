//! # Null Driver
//!
//! A device with no hardware behind it. Streams can be set up, activated
//! and closed, but every transfer reports `NotSupported`. Useful for
//! exercising the stream lifecycle and the log slot without a radio.
//!
//! The null driver is only selected when named, either with
//! `driver=null` or, for discovery, `type=null`.
//!
//! ```rust,ignore
//! let device = registry.make(&"driver=null".into())?;
//! let mut rx = device.setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())?;
//! rx.activate(StreamFlags::NONE, 0, 0)?;
//! let result = rx.read(&mut [&mut buf[..]], 100_000)?;
//! assert_eq!(result.status, ErrorCode::NotSupported);
//! ```

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use sdrstream_core::logger::LogLevel;
use sdrstream_core::registry::NULL_DRIVER;
use sdrstream_core::{
    sdr_log, DeviceDriver, Direction, ErrorCode, Kwargs, SdrDevice, SdrError, SdrResult, StreamFlags,
    StreamFormat, StreamHandle, StreamResult,
};

const NUM_CHANNELS: usize = 2;

/// Discovery and construction for [`NullDevice`].
#[derive(Debug, Default)]
pub struct NullDriver;

impl NullDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDriver for NullDriver {
    fn name(&self) -> &str {
        NULL_DRIVER
    }

    fn find(&self, args: &Kwargs) -> Vec<Kwargs> {
        if args.get("type") != Some(NULL_DRIVER) {
            return Vec::new();
        }
        vec![Kwargs::from([("type", NULL_DRIVER)])]
    }

    fn make(&self, _args: &Kwargs) -> SdrResult<Box<dyn SdrDevice>> {
        Ok(Box::new(NullDevice::new()?))
    }
}

/// Device that accepts every configuration and moves no samples.
#[derive(Debug, Default)]
pub struct NullDevice {
    streams: Mutex<HashSet<StreamHandle>>,
}

impl NullDevice {
    /// Create the device. Emits one test message at each of the error,
    /// warning and info levels; a failing log handler fails construction.
    pub fn new() -> SdrResult<Self> {
        sdr_log!(LogLevel::Error, "This is a test {} log message - {}", "error", 3)?;
        sdr_log!(LogLevel::Warning, "This is a test {} log message - {}", "warning", 4)?;
        sdr_log!(LogLevel::Info, "This is a test {} log message - {}", "info", 6)?;
        Ok(Self::default())
    }

    fn open_streams(&self) -> std::sync::MutexGuard<'_, HashSet<StreamHandle>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SdrDevice for NullDevice {
    fn driver_key(&self) -> String {
        NULL_DRIVER.to_string()
    }

    fn hardware_key(&self) -> String {
        NULL_DRIVER.to_string()
    }

    fn num_channels(&self, _direction: Direction) -> usize {
        NUM_CHANNELS
    }

    fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<StreamFormat> {
        StreamFormat::ALL.to_vec()
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (StreamFormat, f64) {
        (StreamFormat::CF32, 1.0)
    }

    fn setup_stream(
        &self,
        direction: Direction,
        format: StreamFormat,
        channels: &[usize],
        _args: &Kwargs,
    ) -> SdrResult<StreamHandle> {
        let handle = StreamHandle::next();
        self.open_streams().insert(handle);
        tracing::debug!(%handle, %direction, %format, ?channels, "null stream created");
        Ok(handle)
    }

    fn close_stream(&self, handle: StreamHandle) -> SdrResult<()> {
        if self.open_streams().remove(&handle) {
            Ok(())
        } else {
            Err(SdrError::NotFound(format!("{} is not open", handle)))
        }
    }

    /// Nothing is written; the request flags are echoed back.
    fn write_stream(
        &self,
        _handle: StreamHandle,
        _buffs: &[&[u8]],
        _num_elems: usize,
        flags: StreamFlags,
        _time_ns: i64,
        _timeout_us: i64,
    ) -> StreamResult {
        StreamResult::status(ErrorCode::NotSupported).with_flags(flags)
    }
}
