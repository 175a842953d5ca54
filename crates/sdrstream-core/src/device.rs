//! # Device Facade
//!
//! [`SdrDevice`] is the surface a driver implements. Only identification,
//! channel counts and the stream calls carry real semantics in the core;
//! every other capability (frontend tuning, clocking, sensors, settings,
//! registers, GPIO, I2C/SPI/UART) is an opaque keyed get/set whose default
//! implementation does nothing.
//!
//! Applications hold a [`Device`], a cheaply cloneable handle that adds
//! channel ownership tracking and hands out [`Stream`]s.
//!
//! ```text
//! DriverRegistry::make(args) ──► Device ──setup_stream──► Stream
//!                                  │                        │
//!                                  └── Arc<dyn SdrDevice> ◄─┘
//! ```

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use num_complex::Complex;

use crate::direct::DirectBuffer;
use crate::error::{ErrorCode, SdrError, SdrResult};
use crate::flags::StreamFlags;
use crate::format::StreamFormat;
use crate::kwargs::Kwargs;
use crate::stream::{Stream, StreamDescriptor};
use crate::types::{ArgInfo, Direction, Range};

/// Default maximum transfer unit in elements.
pub const DEFAULT_MTU: usize = 1024;

/// Opaque driver-side stream identifier.
///
/// Allocated from a process-wide counter, so a handle is never reused even
/// after the stream that owned it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StreamHandle(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Outcome of one read, write or status call.
///
/// A non-`None` status is a data-plane condition, not a failure of the
/// call itself: callers log it and keep looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamResult {
    pub status: ErrorCode,
    /// Elements transferred per channel
    pub num_elems: usize,
    pub flags: StreamFlags,
    /// Timestamp of the first element, valid with `HAS_TIME`
    pub time_ns: i64,
    /// Channels the status applies to (status reports only)
    pub chan_mask: usize,
}

impl StreamResult {
    /// Successful transfer of `num_elems` elements.
    pub fn ok(num_elems: usize) -> Self {
        Self {
            num_elems,
            ..Default::default()
        }
    }

    /// No transfer, with the given status.
    pub fn status(status: ErrorCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Attach a timestamp and set `HAS_TIME`.
    pub fn with_time(mut self, time_ns: i64) -> Self {
        self.time_ns = time_ns;
        self.flags |= StreamFlags::HAS_TIME;
        self
    }

    pub fn with_chan_mask(mut self, mask: usize) -> Self {
        self.chan_mask = mask;
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Time if `HAS_TIME` is set.
    pub fn time(&self) -> Option<i64> {
        self.flags
            .contains(StreamFlags::HAS_TIME)
            .then_some(self.time_ns)
    }
}

/// Driver-facing device interface.
///
/// All methods take `&self`; drivers keep mutable state behind their own
/// locks so distinct streams can be driven from distinct threads. Buffers
/// reach the driver as raw bytes, one slice per channel, already validated
/// against the stream's format and channel count.
pub trait SdrDevice: Send + Sync {
    // ----- identification -----

    fn driver_key(&self) -> String;

    fn hardware_key(&self) -> String;

    fn hardware_info(&self) -> Kwargs {
        Kwargs::new()
    }

    // ----- channels -----

    fn num_channels(&self, direction: Direction) -> usize;

    fn channel_info(&self, _direction: Direction, _channel: usize) -> Kwargs {
        Kwargs::new()
    }

    fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    // ----- streams -----

    fn stream_formats(&self, direction: Direction, channel: usize) -> Vec<StreamFormat>;

    /// Native format and its full-scale value.
    fn native_stream_format(&self, direction: Direction, channel: usize) -> (StreamFormat, f64);

    fn stream_args_info(&self, _direction: Direction, _channel: usize) -> Vec<ArgInfo> {
        Vec::new()
    }

    /// Create driver-side stream state. Channels and format are validated by
    /// [`Device::setup_stream`] before this is called.
    fn setup_stream(
        &self,
        direction: Direction,
        format: StreamFormat,
        channels: &[usize],
        args: &Kwargs,
    ) -> SdrResult<StreamHandle>;

    fn close_stream(&self, handle: StreamHandle) -> SdrResult<()>;

    fn stream_mtu(&self, _handle: StreamHandle) -> usize {
        DEFAULT_MTU
    }

    fn activate_stream(
        &self,
        _handle: StreamHandle,
        flags: StreamFlags,
        _time_ns: i64,
        _num_elems: usize,
    ) -> Result<(), ErrorCode> {
        if flags.is_empty() {
            Ok(())
        } else {
            Err(ErrorCode::NotSupported)
        }
    }

    fn deactivate_stream(
        &self,
        _handle: StreamHandle,
        flags: StreamFlags,
        _time_ns: i64,
    ) -> Result<(), ErrorCode> {
        if flags.is_empty() {
            Ok(())
        } else {
            Err(ErrorCode::NotSupported)
        }
    }

    fn read_stream(
        &self,
        _handle: StreamHandle,
        _buffs: &mut [&mut [u8]],
        _num_elems: usize,
        _timeout_us: i64,
    ) -> StreamResult {
        StreamResult::status(ErrorCode::NotSupported)
    }

    fn write_stream(
        &self,
        _handle: StreamHandle,
        _buffs: &[&[u8]],
        _num_elems: usize,
        _flags: StreamFlags,
        _time_ns: i64,
        _timeout_us: i64,
    ) -> StreamResult {
        StreamResult::status(ErrorCode::NotSupported)
    }

    fn read_stream_status(&self, _handle: StreamHandle, _timeout_us: i64) -> StreamResult {
        StreamResult::status(ErrorCode::NotSupported)
    }

    // ----- direct buffer access -----

    /// Size of the driver's buffer pool, 0 without direct access.
    fn num_direct_access_buffers(&self, _handle: StreamHandle) -> usize {
        0
    }

    fn direct_access_buffer_addrs(&self, _handle: StreamHandle, _index: usize) -> Result<Vec<usize>, ErrorCode> {
        Err(ErrorCode::NotSupported)
    }

    /// Loan out the next filled receive buffer, or report why there is none.
    fn acquire_read_buffer(&self, _handle: StreamHandle, _timeout_us: i64) -> Result<DirectBuffer, StreamResult> {
        Err(StreamResult::status(ErrorCode::NotSupported))
    }

    fn release_read_buffer(&self, _handle: StreamHandle, _buffer: DirectBuffer) {}

    /// Loan out an empty transmit buffer with `num_elems` set to its room.
    fn acquire_write_buffer(&self, _handle: StreamHandle, _timeout_us: i64) -> Result<DirectBuffer, StreamResult> {
        Err(StreamResult::status(ErrorCode::NotSupported))
    }

    /// Take back a transmit buffer and send its first `num_elems` elements.
    fn release_write_buffer(
        &self,
        _handle: StreamHandle,
        _buffer: DirectBuffer,
        _num_elems: usize,
        _flags: StreamFlags,
        _time_ns: i64,
    ) -> StreamResult {
        StreamResult::status(ErrorCode::NotSupported)
    }

    // ----- antennas and corrections -----

    fn list_antennas(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        Vec::new()
    }

    fn set_antenna(&self, _direction: Direction, _channel: usize, _name: &str) -> SdrResult<()> {
        Ok(())
    }

    fn antenna(&self, _direction: Direction, _channel: usize) -> String {
        String::new()
    }

    fn has_dc_offset_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    fn set_dc_offset_mode(&self, _direction: Direction, _channel: usize, _automatic: bool) -> SdrResult<()> {
        Ok(())
    }

    fn dc_offset_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    fn set_dc_offset(&self, _direction: Direction, _channel: usize, _offset: Complex<f64>) -> SdrResult<()> {
        Ok(())
    }

    fn dc_offset(&self, _direction: Direction, _channel: usize) -> Complex<f64> {
        Complex::new(0.0, 0.0)
    }

    fn set_iq_balance(&self, _direction: Direction, _channel: usize, _balance: Complex<f64>) -> SdrResult<()> {
        Ok(())
    }

    fn iq_balance(&self, _direction: Direction, _channel: usize) -> Complex<f64> {
        Complex::new(0.0, 0.0)
    }

    fn set_frequency_correction(&self, _direction: Direction, _channel: usize, _ppm: f64) -> SdrResult<()> {
        Ok(())
    }

    fn frequency_correction(&self, _direction: Direction, _channel: usize) -> f64 {
        0.0
    }

    // ----- gain -----

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        Vec::new()
    }

    fn has_gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    fn set_gain_mode(&self, _direction: Direction, _channel: usize, _automatic: bool) -> SdrResult<()> {
        Ok(())
    }

    fn gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        false
    }

    fn set_gain(&self, _direction: Direction, _channel: usize, _gain_db: f64) -> SdrResult<()> {
        Ok(())
    }

    /// Overall gain. Defaults to the sum of the element gains.
    fn gain(&self, direction: Direction, channel: usize) -> f64 {
        self.list_gains(direction, channel)
            .iter()
            .map(|name| self.gain_element(direction, channel, name))
            .sum()
    }

    fn set_gain_element(&self, _direction: Direction, _channel: usize, _name: &str, _gain_db: f64) -> SdrResult<()> {
        Ok(())
    }

    fn gain_element(&self, _direction: Direction, _channel: usize, _name: &str) -> f64 {
        0.0
    }

    fn gain_range(&self, _direction: Direction, _channel: usize) -> Range {
        Range::default()
    }

    fn gain_element_range(&self, _direction: Direction, _channel: usize, _name: &str) -> Range {
        Range::default()
    }

    // ----- frequency -----

    fn set_frequency(&self, _direction: Direction, _channel: usize, _frequency: f64, _args: &Kwargs) -> SdrResult<()> {
        Ok(())
    }

    fn frequency(&self, _direction: Direction, _channel: usize) -> f64 {
        0.0
    }

    fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        Vec::new()
    }

    fn set_frequency_component(
        &self,
        _direction: Direction,
        _channel: usize,
        _name: &str,
        _frequency: f64,
        _args: &Kwargs,
    ) -> SdrResult<()> {
        Ok(())
    }

    fn frequency_component(&self, _direction: Direction, _channel: usize, _name: &str) -> f64 {
        0.0
    }

    fn frequency_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        Vec::new()
    }

    fn frequency_args_info(&self, _direction: Direction, _channel: usize) -> Vec<ArgInfo> {
        Vec::new()
    }

    // ----- sample rate and bandwidth -----

    fn set_sample_rate(&self, _direction: Direction, _channel: usize, _rate: f64) -> SdrResult<()> {
        Ok(())
    }

    fn sample_rate(&self, _direction: Direction, _channel: usize) -> f64 {
        0.0
    }

    fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        Vec::new()
    }

    fn set_bandwidth(&self, _direction: Direction, _channel: usize, _bandwidth: f64) -> SdrResult<()> {
        Ok(())
    }

    fn bandwidth(&self, _direction: Direction, _channel: usize) -> f64 {
        0.0
    }

    fn bandwidth_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        Vec::new()
    }

    // ----- clocking and time -----

    fn set_master_clock_rate(&self, _rate: f64) -> SdrResult<()> {
        Ok(())
    }

    fn master_clock_rate(&self) -> f64 {
        0.0
    }

    fn list_clock_sources(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_clock_source(&self, _source: &str) -> SdrResult<()> {
        Ok(())
    }

    fn clock_source(&self) -> String {
        String::new()
    }

    fn list_time_sources(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_time_source(&self, _source: &str) -> SdrResult<()> {
        Ok(())
    }

    fn time_source(&self) -> String {
        String::new()
    }

    /// True if the named time counter exists (empty name is the default).
    fn has_hardware_time(&self, _what: &str) -> bool {
        false
    }

    fn hardware_time(&self, _what: &str) -> i64 {
        0
    }

    fn set_hardware_time(&self, _time_ns: i64, _what: &str) -> SdrResult<()> {
        Ok(())
    }

    // ----- sensors -----

    fn list_sensors(&self) -> Vec<String> {
        Vec::new()
    }

    fn sensor_info(&self, key: &str) -> ArgInfo {
        ArgInfo {
            key: key.to_string(),
            ..Default::default()
        }
    }

    fn read_sensor(&self, _key: &str) -> SdrResult<String> {
        Ok(String::new())
    }

    fn list_channel_sensors(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        Vec::new()
    }

    fn read_channel_sensor(&self, _direction: Direction, _channel: usize, _key: &str) -> SdrResult<String> {
        Ok(String::new())
    }

    // ----- settings -----

    fn setting_info(&self) -> Vec<ArgInfo> {
        Vec::new()
    }

    fn write_setting(&self, _key: &str, _value: &str) -> SdrResult<()> {
        Ok(())
    }

    fn read_setting(&self, _key: &str) -> SdrResult<String> {
        Ok(String::new())
    }

    fn channel_setting_info(&self, _direction: Direction, _channel: usize) -> Vec<ArgInfo> {
        Vec::new()
    }

    fn write_channel_setting(&self, _direction: Direction, _channel: usize, _key: &str, _value: &str) -> SdrResult<()> {
        Ok(())
    }

    fn read_channel_setting(&self, _direction: Direction, _channel: usize, _key: &str) -> SdrResult<String> {
        Ok(String::new())
    }

    // ----- registers and GPIO -----

    fn list_register_interfaces(&self) -> Vec<String> {
        Vec::new()
    }

    fn write_register(&self, _name: &str, _addr: u32, _value: u32) -> SdrResult<()> {
        Ok(())
    }

    fn read_register(&self, _name: &str, _addr: u32) -> SdrResult<u32> {
        Ok(0)
    }

    fn list_gpio_banks(&self) -> Vec<String> {
        Vec::new()
    }

    fn write_gpio(&self, _bank: &str, _value: u32) -> SdrResult<()> {
        Ok(())
    }

    /// Write only the bits set in `mask`.
    fn write_gpio_masked(&self, bank: &str, value: u32, mask: u32) -> SdrResult<()> {
        let current = self.read_gpio(bank)?;
        self.write_gpio(bank, (current & !mask) | (value & mask))
    }

    fn read_gpio(&self, _bank: &str) -> SdrResult<u32> {
        Ok(0)
    }

    fn write_gpio_dir(&self, _bank: &str, _dir: u32) -> SdrResult<()> {
        Ok(())
    }

    fn read_gpio_dir(&self, _bank: &str) -> SdrResult<u32> {
        Ok(0)
    }

    // ----- opaque pass-through buses -----

    fn write_i2c(&self, _addr: u32, _data: &[u8]) -> SdrResult<()> {
        Ok(())
    }

    fn read_i2c(&self, _addr: u32, _num_bytes: usize) -> SdrResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Clock `num_bits` of `data` out and return the bits clocked in.
    fn transact_spi(&self, _addr: u32, _data: u32, _num_bits: usize) -> SdrResult<u32> {
        Ok(0)
    }

    fn list_uarts(&self) -> Vec<String> {
        Vec::new()
    }

    fn write_uart(&self, _which: &str, _data: &str) -> SdrResult<()> {
        Ok(())
    }

    fn read_uart(&self, _which: &str, _timeout_us: i64) -> SdrResult<String> {
        Ok(String::new())
    }
}

/// Ownership of device channels by live streams.
#[derive(Debug, Default)]
pub struct ChannelClaims {
    owned: Mutex<HashSet<(Direction, usize)>>,
}

impl ChannelClaims {
    /// Claim all `channels` or none of them.
    pub fn claim(&self, direction: Direction, channels: &[usize]) -> SdrResult<()> {
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&channel) = channels.iter().find(|&&c| owned.contains(&(direction, c))) {
            return Err(SdrError::ChannelInUse { direction, channel });
        }
        owned.extend(channels.iter().map(|&c| (direction, c)));
        Ok(())
    }

    pub fn release(&self, direction: Direction, channels: &[usize]) {
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        for &c in channels {
            owned.remove(&(direction, c));
        }
    }

    pub fn is_claimed(&self, direction: Direction, channel: usize) -> bool {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(direction, channel))
    }
}

pub(crate) struct DeviceInner {
    driver: Box<dyn SdrDevice>,
    claims: ChannelClaims,
}

/// Application handle to an opened device.
///
/// Clones share the same driver instance and channel claims. The driver is
/// dropped when the last handle and the last stream are gone.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new<D: SdrDevice + 'static>(driver: D) -> Self {
        Self::from_boxed(Box::new(driver))
    }

    pub fn from_boxed(driver: Box<dyn SdrDevice>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                driver,
                claims: ChannelClaims::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DeviceInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<DeviceInner> {
        Arc::downgrade(&self.inner)
    }

    /// True if both handles refer to the same opened device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn claims(&self) -> &ChannelClaims {
        &self.inner.claims
    }

    /// Validate a stream request, claim its channels and create the stream.
    ///
    /// An empty channel list selects channel 0.
    pub fn setup_stream(
        &self,
        direction: Direction,
        format: StreamFormat,
        channels: &[usize],
        args: &Kwargs,
    ) -> SdrResult<Stream> {
        let channels: Vec<usize> = if channels.is_empty() {
            vec![0]
        } else {
            channels.to_vec()
        };

        let available = self.num_channels(direction);
        for (i, &channel) in channels.iter().enumerate() {
            if channel >= available {
                return Err(SdrError::InvalidChannel {
                    channel,
                    available,
                    direction,
                });
            }
            if channels[..i].contains(&channel) {
                return Err(SdrError::InvalidArgument(format!(
                    "channel {} listed twice",
                    channel
                )));
            }
            if !self.stream_formats(direction, channel).contains(&format) {
                return Err(SdrError::UnsupportedFormat {
                    format,
                    direction,
                    channel,
                });
            }
        }

        self.claims().claim(direction, &channels)?;
        let handle = match self.driver().setup_stream(direction, format, &channels, args) {
            Ok(handle) => handle,
            Err(e) => {
                self.claims().release(direction, &channels);
                return Err(e);
            }
        };

        tracing::debug!(
            device = %self,
            %handle,
            %direction,
            %format,
            ?channels,
            "stream configured"
        );

        Ok(Stream::new(
            self.clone(),
            handle,
            StreamDescriptor {
                direction,
                format,
                channels,
                args: args.clone(),
            },
        ))
    }

    /// The driver behind this handle.
    pub fn driver(&self) -> &(dyn SdrDevice + 'static) {
        &*self.inner.driver
    }
}

impl Deref for Device {
    type Target = dyn SdrDevice;

    fn deref(&self) -> &Self::Target {
        self.driver()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.driver_key(), self.hardware_key())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.driver_key())
            .field("hardware", &self.hardware_key())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-crate test driver: two channels per direction, CF32 and CS16,
    /// records activate/deactivate/close calls and echoes writes. Transfers
    /// are capped at an MTU of 256 elements.
    #[derive(Default)]
    pub(crate) struct MockDevice {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_activate: Option<ErrorCode>,
        /// Accept every stream format
        pub all_formats: bool,
        pub settings: Mutex<HashMap<String, String>>,
    }

    const MOCK_MTU: usize = 256;
    const MOCK_POOL: usize = 4;

    impl MockDevice {
        fn record(&self, call: String) {
            self.log.lock().unwrap().push(call);
        }
    }

    impl SdrDevice for MockDevice {
        fn driver_key(&self) -> String {
            "mock".into()
        }

        fn hardware_key(&self) -> String {
            "mock-hw".into()
        }

        fn num_channels(&self, _direction: Direction) -> usize {
            2
        }

        fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<StreamFormat> {
            if self.all_formats {
                return StreamFormat::ALL.to_vec();
            }
            vec![StreamFormat::CF32, StreamFormat::CS16, StreamFormat::CS12]
        }

        fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (StreamFormat, f64) {
            (StreamFormat::CS16, 32768.0)
        }

        fn setup_stream(
            &self,
            direction: Direction,
            format: StreamFormat,
            channels: &[usize],
            _args: &Kwargs,
        ) -> SdrResult<StreamHandle> {
            self.record(format!("setup {} {} {:?}", direction, format, channels));
            Ok(StreamHandle::next())
        }

        fn close_stream(&self, _handle: StreamHandle) -> SdrResult<()> {
            self.record("close".into());
            Ok(())
        }

        fn stream_mtu(&self, _handle: StreamHandle) -> usize {
            MOCK_MTU
        }

        fn activate_stream(
            &self,
            _handle: StreamHandle,
            _flags: StreamFlags,
            _time_ns: i64,
            num_elems: usize,
        ) -> Result<(), ErrorCode> {
            self.record(format!("activate {}", num_elems));
            match self.fail_activate {
                Some(code) => Err(code),
                None => Ok(()),
            }
        }

        fn deactivate_stream(
            &self,
            _handle: StreamHandle,
            _flags: StreamFlags,
            _time_ns: i64,
        ) -> Result<(), ErrorCode> {
            self.record("deactivate".into());
            Ok(())
        }

        fn read_stream(
            &self,
            _handle: StreamHandle,
            buffs: &mut [&mut [u8]],
            num_elems: usize,
            _timeout_us: i64,
        ) -> StreamResult {
            let num_elems = num_elems.min(MOCK_MTU);
            for buf in buffs.iter_mut() {
                buf.fill(0x11);
            }
            self.record(format!("read {}", num_elems));
            StreamResult::ok(num_elems).with_time(42)
        }

        fn write_stream(
            &self,
            _handle: StreamHandle,
            _buffs: &[&[u8]],
            num_elems: usize,
            flags: StreamFlags,
            _time_ns: i64,
            _timeout_us: i64,
        ) -> StreamResult {
            let num_elems = num_elems.min(MOCK_MTU);
            self.record(format!("write {} {:?}", num_elems, flags));
            StreamResult::ok(num_elems)
        }

        fn read_stream_status(&self, _handle: StreamHandle, _timeout_us: i64) -> StreamResult {
            StreamResult::status(ErrorCode::Timeout)
        }

        fn num_direct_access_buffers(&self, _handle: StreamHandle) -> usize {
            MOCK_POOL
        }

        fn direct_access_buffer_addrs(&self, _handle: StreamHandle, index: usize) -> Result<Vec<usize>, ErrorCode> {
            if index < MOCK_POOL {
                Ok(vec![0x1000 * (index + 1)])
            } else {
                Err(ErrorCode::NotSupported)
            }
        }

        // single channel CF32 buffers, read slot 1 and write slot 2
        fn acquire_read_buffer(&self, _handle: StreamHandle, _timeout_us: i64) -> Result<DirectBuffer, StreamResult> {
            let mut buffer = DirectBuffer::new(1, 1, MOCK_MTU, 8);
            buffer.buffs[0].fill(0x22);
            buffer.flags = StreamFlags::HAS_TIME;
            buffer.time_ns = 7;
            Ok(buffer)
        }

        fn release_read_buffer(&self, _handle: StreamHandle, buffer: DirectBuffer) {
            self.record(format!("release read {}", buffer.index));
        }

        fn acquire_write_buffer(&self, _handle: StreamHandle, _timeout_us: i64) -> Result<DirectBuffer, StreamResult> {
            Ok(DirectBuffer::new(2, 1, MOCK_MTU, 8))
        }

        fn release_write_buffer(
            &self,
            _handle: StreamHandle,
            buffer: DirectBuffer,
            num_elems: usize,
            flags: StreamFlags,
            _time_ns: i64,
        ) -> StreamResult {
            self.record(format!("release write {} {} {:?}", buffer.index, num_elems, flags));
            StreamResult::ok(num_elems)
        }

        fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
            vec!["LNA".into(), "VGA".into()]
        }

        fn gain_element(&self, _direction: Direction, _channel: usize, name: &str) -> f64 {
            if name == "LNA" {
                10.0
            } else {
                5.5
            }
        }

        fn write_gpio(&self, bank: &str, value: u32) -> SdrResult<()> {
            self.settings
                .lock()
                .unwrap()
                .insert(bank.to_string(), value.to_string());
            Ok(())
        }

        fn read_gpio(&self, bank: &str) -> SdrResult<u32> {
            Ok(self
                .settings
                .lock()
                .unwrap()
                .get(bank)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0))
        }
    }

    #[test]
    fn test_stream_handles_unique() {
        let a = StreamHandle::next();
        let b = StreamHandle::next();
        assert_ne!(a, b);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_stream_result_builders() {
        let r = StreamResult::ok(10).with_time(5).with_chan_mask(0b11);
        assert!(r.is_ok());
        assert_eq!(r.time(), Some(5));
        assert_eq!(r.chan_mask, 3);
        assert_eq!(StreamResult::status(ErrorCode::Timeout).time(), None);
    }

    #[test]
    fn test_default_gain_sums_elements() {
        let dev = Device::new(MockDevice::default());
        assert_eq!(dev.gain(Direction::Rx, 0), 15.5);
        assert_eq!(dev.to_string(), "mock:mock-hw");
    }

    #[test]
    fn test_gpio_masked_write() {
        let dev = Device::new(MockDevice::default());
        dev.write_gpio("MAIN", 0b1010).unwrap();
        dev.write_gpio_masked("MAIN", 0b0101, 0b0011).unwrap();
        assert_eq!(dev.read_gpio("MAIN").unwrap(), 0b1001);
    }

    #[test]
    fn test_setup_validates_channels_and_format() {
        let dev = Device::new(MockDevice::default());
        let err = dev
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0, 2], &Kwargs::new())
            .unwrap_err();
        assert_eq!(
            err,
            SdrError::InvalidChannel {
                channel: 2,
                available: 2,
                direction: Direction::Rx
            }
        );

        let err = dev
            .setup_stream(Direction::Rx, StreamFormat::CU8, &[0], &Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, SdrError::UnsupportedFormat { .. }));

        let err = dev
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[1, 1], &Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, SdrError::InvalidArgument(_)));
        assert!(!dev.claims().is_claimed(Direction::Rx, 1));
    }

    #[test]
    fn test_exclusive_channel_claims() {
        let dev = Device::new(MockDevice::default());
        let first = dev
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        let err = dev
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[1, 0], &Kwargs::new())
            .unwrap_err();
        assert_eq!(
            err,
            SdrError::ChannelInUse {
                direction: Direction::Rx,
                channel: 0
            }
        );
        // nothing partially claimed
        assert!(!dev.claims().is_claimed(Direction::Rx, 1));

        // same channel in the other direction is fine
        let _tx = dev
            .setup_stream(Direction::Tx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();

        drop(first);
        assert!(!dev.claims().is_claimed(Direction::Rx, 0));
        assert!(dev
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[], &Kwargs::new())
            .is_ok());
    }
}
