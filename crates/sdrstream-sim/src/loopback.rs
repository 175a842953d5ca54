//! # Loopback Driver
//!
//! Software device that routes transmitted samples back to the receive side.
//! Samples written on Tx channel `n` appear on Rx channel `n` while an Rx
//! stream on that channel is active.
//!
//! ## Behavior
//!
//! - **Formats**: any format the converter registry maps to CF32 (Tx) or
//!   from CF32 (Rx). Tx and Rx streams may use different formats; samples
//!   are carried as normalized `Complex<f32>`.
//! - **Direct access**: each stream owns `buffers` transfer buffers of
//!   `bufflen` elements that can be loaned out instead of copying.
//! - **Buffering**: each Rx channel holds `bufflen * buffers` elements. When
//!   full, the oldest samples are dropped, `"O"` is logged once and the next
//!   read reports `Overflow`.
//! - **Time**: Rx reads carry `HAS_TIME` timestamps derived from a per-channel
//!   sample counter. The hardware clock starts at zero when the device opens.
//! - **Late packets**: a Tx write with `HAS_TIME` in the past is dropped,
//!   `"L"` is logged and a `TimeError` event is queued for
//!   [`Stream::read_status`](sdrstream_core::Stream::read_status).
//! - **Bursts**: every Tx write with `END_BURST` queues an ack event.
//!
//! ## Stream Args
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `bufflen` | 1024 | MTU in elements |
//! | `buffers` | 8 | FIFO depth in MTUs, and direct access buffer count |
//! | `rx_source` | `loopback` | `loopback` or `tone` |
//! | `tone_freq` | 10000 | Tone offset in Hz |
//! | `tone_ampl` | 0.7 | Tone amplitude, 0 to 1 |
//!
//! ## Usage
//!
//! ```rust,ignore
//! let device = registry.make(&"driver=loopback".into())?;
//! let mut tx = device.setup_stream(Direction::Tx, StreamFormat::CF32, &[0], &Kwargs::new())?;
//! let mut rx = device.setup_stream(Direction::Rx, StreamFormat::CS16, &[0], &Kwargs::new())?;
//! rx.activate(StreamFlags::NONE, 0, 0)?;
//! tx.activate(StreamFlags::NONE, 0, 0)?;
//! tx.write(&[&samples[..]], StreamFlags::NONE, 0, 100_000)?;
//! let result = rx.read(&mut [&mut buf[..]], 100_000)?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use num_complex::Complex;
use sdrstream_core::logger::{self, LogLevel};
use sdrstream_core::{
    converters, time_ns_to_ticks, ticks_to_time_ns, ArgInfo, ArgType, ConverterFn, DeviceDriver, DirectBuffer,
    Direction, ErrorCode, Kwargs, Range, SdrDevice, SdrError, SdrResult, StreamFlags, StreamFormat,
    StreamHandle, StreamResult, DEFAULT_MTU,
};

use crate::settings::SettingsStore;

pub const LOOPBACK_DRIVER: &str = "loopback";

const DEFAULT_CHANNELS: usize = 2;
const DEFAULT_BUFFERS: usize = 8;
const DEFAULT_SAMPLE_RATE: f64 = 1e6;
const DEFAULT_TONE_FREQ: f64 = 10e3;
const DEFAULT_TONE_AMPL: f32 = 0.7;
const MASTER_CLOCK_RATE: f64 = 100e6;
const MAX_EVENTS: usize = 64;

const ANTENNA: &str = "LOOP";
const GAINS: [(&str, f64); 2] = [("LNA", 30.0), ("PGA", 40.0)];
const RF_COMPONENT: &str = "RF";
const CLOCK_SOURCES: [&str; 2] = ["internal", "external"];
const TIME_SOURCES: [&str; 2] = ["internal", "pps"];
const REGISTER_IFACE: &str = "FPGA";
const GPIO_BANK: &str = "MAIN";
const UART: &str = "console";
const LOOPBACK_SETTING: &str = "loopback";

/// Discovery and construction for [`LoopbackDevice`].
#[derive(Debug, Default)]
pub struct LoopbackDriver;

impl LoopbackDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDriver for LoopbackDriver {
    fn name(&self) -> &str {
        LOOPBACK_DRIVER
    }

    /// Always finds one virtual device, using the requested serial if any.
    fn find(&self, args: &Kwargs) -> Vec<Kwargs> {
        if args.get("type").is_some_and(|t| t != LOOPBACK_DRIVER) {
            return Vec::new();
        }
        let serial = args.get("serial").unwrap_or("0");
        tracing::debug!(serial, "loopback discover");
        vec![Kwargs::new()
            .with("type", LOOPBACK_DRIVER)
            .with("label", format!("Loopback #{}", serial))
            .with("serial", serial)]
    }

    fn make(&self, args: &Kwargs) -> SdrResult<Box<dyn SdrDevice>> {
        Ok(Box::new(LoopbackDevice::from_args(args)?))
    }
}

/// Loopback device handle. Clones share the same device, so a test can keep
/// one to inject samples after handing another to
/// [`Device::new`](sdrstream_core::Device::new).
#[derive(Clone)]
pub struct LoopbackDevice {
    inner: Arc<Inner>,
}

struct Inner {
    serial: String,
    channels: usize,
    settings: SettingsStore,
    clock: Mutex<Clock>,
    rx: Mutex<Vec<RxChannel>>,
    rx_ready: Condvar,
    streams: Mutex<HashMap<StreamHandle, StreamEntry>>,
    events_ready: Condvar,
    i2c: Mutex<HashMap<u32, VecDeque<u8>>>,
    uart: Mutex<String>,
}

struct Clock {
    base_ns: i64,
    since: Instant,
}

impl Clock {
    fn now_ns(&self) -> i64 {
        let elapsed = i64::try_from(self.since.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.base_ns.saturating_add(elapsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RxSource {
    Loopback,
    Tone { freq: f64, amplitude: f32 },
}

/// Samples are held as CF32; every stream converts at its boundary.
const NATIVE_FORMAT: StreamFormat = StreamFormat::CF32;

struct StreamEntry {
    direction: Direction,
    format: StreamFormat,
    channels: Vec<usize>,
    mtu: usize,
    depth: usize,
    source: RxSource,
    active: bool,
    events: VecDeque<StreamResult>,
    /// Wire to native for Tx, native to wire for Rx
    convert: ConverterFn,
    /// Direct access buffers, `None` while on loan
    pool: Vec<Option<DirectBuffer>>,
    addrs: Vec<Vec<usize>>,
}

impl StreamEntry {
    /// Direct access buffers, allocated on first use.
    fn pool(&mut self) -> &mut Vec<Option<DirectBuffer>> {
        if self.pool.is_empty() {
            let (channels, mtu, size) = (self.channels.len(), self.mtu, self.format.size());
            self.pool = (0..self.depth)
                .map(|index| Some(DirectBuffer::new(index, channels, mtu, size)))
                .collect();
            self.addrs = self.pool.iter().flatten().map(DirectBuffer::addrs).collect();
        }
        &mut self.pool
    }
}

/// Per-call snapshot of a stream's configuration.
struct StreamInfo {
    format: StreamFormat,
    channels: Vec<usize>,
    mtu: usize,
    convert: ConverterFn,
}

struct ToneState {
    step: f64,
    phase: f64,
    amplitude: f32,
}

struct RxChannel {
    owner: Option<StreamHandle>,
    fifo: VecDeque<Complex<f32>>,
    capacity: usize,
    /// Sample counter of the FIFO head
    next_tick: i64,
    overflow: bool,
    end_of_stream: bool,
    tone: Option<ToneState>,
}

impl RxChannel {
    fn new() -> Self {
        Self {
            owner: None,
            fifo: VecDeque::new(),
            capacity: DEFAULT_MTU * DEFAULT_BUFFERS,
            next_tick: 0,
            overflow: false,
            end_of_stream: false,
            tone: None,
        }
    }

    /// Append samples, dropping the oldest beyond capacity. Returns true
    /// when this push starts a new overflow.
    fn push(&mut self, samples: &[Complex<f32>]) -> bool {
        self.fifo.extend(samples.iter().copied());
        let excess = self.fifo.len().saturating_sub(self.capacity);
        if excess == 0 {
            return false;
        }
        self.fifo.drain(..excess);
        self.next_tick = self.next_tick.saturating_add(excess as i64);
        let first = !self.overflow;
        self.overflow = true;
        first
    }

    fn fill_tone(&mut self, wanted: usize) {
        let Some(tone) = self.tone.as_mut() else {
            return;
        };
        while self.fifo.len() < wanted {
            let sample = Complex::from_polar(tone.amplitude, tone.phase as f32);
            self.fifo.push_back(sample);
            tone.phase = (tone.phase + tone.step) % TAU;
        }
    }

    fn release(&mut self) {
        self.owner = None;
        self.fifo.clear();
        self.overflow = false;
        self.end_of_stream = false;
        self.tone = None;
    }
}

fn parse_arg<T: FromStr>(args: &Kwargs, key: &str, default: T) -> SdrResult<T> {
    match args.get(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| SdrError::InvalidArgument(format!("invalid {}={}", key, value))),
    }
}

fn chan_mask(channels: &[usize]) -> usize {
    channels
        .iter()
        .fold(0, |mask, &c| mask | 1usize.checked_shl(c as u32).unwrap_or(0))
}

fn status_indicator(marker: &str) {
    if let Err(e) = logger::log(LogLevel::Ssi, marker) {
        tracing::debug!(error = %e, marker, "status indicator not delivered");
    }
}

fn deadline_after(timeout_us: i64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_micros(timeout_us.max(0) as u64))
        .unwrap_or(now + Duration::from_secs(24 * 3600))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackDevice {
    /// Create a device with `channels` per direction.
    pub fn new(serial: impl Into<String>, channels: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                serial: serial.into(),
                channels,
                settings: SettingsStore::new(),
                clock: Mutex::new(Clock {
                    base_ns: 0,
                    since: Instant::now(),
                }),
                rx: Mutex::new((0..channels).map(|_| RxChannel::new()).collect()),
                rx_ready: Condvar::new(),
                streams: Mutex::new(HashMap::new()),
                events_ready: Condvar::new(),
                i2c: Mutex::new(HashMap::new()),
                uart: Mutex::new(String::new()),
            }),
        }
    }

    /// Create from device args: `serial` and `channels`.
    pub fn from_args(args: &Kwargs) -> SdrResult<Self> {
        let channels = parse_arg(args, "channels", DEFAULT_CHANNELS)?;
        if channels == 0 {
            return Err(SdrError::InvalidArgument("channels must be at least 1".to_string()));
        }
        let serial = args.get("serial").unwrap_or("0");
        tracing::info!(serial, channels, "loopback device created");
        Ok(Self::new(serial, channels))
    }

    /// Queue samples on an Rx channel as if they had been transmitted.
    ///
    /// With `end_of_stream`, reads report `EndOfStream` once the channel has
    /// drained instead of waiting for more samples.
    pub fn inject(&self, channel: usize, samples: &[Complex<f32>], end_of_stream: bool) -> SdrResult<()> {
        self.check_channel(Direction::Rx, channel)?;
        let overflowed = {
            let mut rx = lock(&self.inner.rx);
            let ch = &mut rx[channel];
            ch.end_of_stream |= end_of_stream;
            ch.push(samples).then_some(ch.owner).flatten()
        };
        self.inner.rx_ready.notify_all();
        if let Some(owner) = overflowed {
            self.report_overflow(owner, channel);
        }
        Ok(())
    }

    fn check_channel(&self, direction: Direction, channel: usize) -> SdrResult<()> {
        if channel < self.inner.channels {
            Ok(())
        } else {
            Err(SdrError::InvalidChannel {
                channel,
                available: self.inner.channels,
                direction,
            })
        }
    }

    fn now_ns(&self) -> i64 {
        lock(&self.inner.clock).now_ns()
    }

    fn key(direction: Direction, channel: usize, name: &str) -> String {
        SettingsStore::channel_key(direction, channel, name)
    }

    fn stream_info(&self, handle: StreamHandle, direction: Direction) -> Option<StreamInfo> {
        let streams = lock(&self.inner.streams);
        streams
            .get(&handle)
            .filter(|entry| entry.direction == direction && entry.active)
            .map(|entry| StreamInfo {
                format: entry.format,
                channels: entry.channels.clone(),
                mtu: entry.mtu,
                convert: entry.convert,
            })
    }

    /// Take a free direct access buffer, sized to the full MTU.
    fn take_buffer(&self, handle: StreamHandle) -> Result<DirectBuffer, StreamResult> {
        let mut streams = lock(&self.inner.streams);
        let entry = streams
            .get_mut(&handle)
            .ok_or(StreamResult::status(ErrorCode::StreamError))?;
        let mut buffer = entry
            .pool()
            .iter_mut()
            .find_map(Option::take)
            .ok_or(StreamResult::status(ErrorCode::Timeout))?;
        buffer.num_elems = entry.mtu;
        buffer.flags = StreamFlags::NONE;
        buffer.time_ns = 0;
        Ok(buffer)
    }

    /// Put a loaned buffer back. Buffers of closed streams are dropped.
    fn return_buffer(&self, handle: StreamHandle, buffer: DirectBuffer) {
        let mut streams = lock(&self.inner.streams);
        if let Some(slot) = streams
            .get_mut(&handle)
            .and_then(|entry| entry.pool.get_mut(buffer.index))
        {
            *slot = Some(buffer);
        }
    }

    fn push_event(&self, handle: StreamHandle, event: StreamResult) {
        let mut streams = lock(&self.inner.streams);
        if let Some(entry) = streams.get_mut(&handle) {
            if entry.events.len() == MAX_EVENTS {
                entry.events.pop_front();
            }
            entry.events.push_back(event);
        }
        drop(streams);
        self.inner.events_ready.notify_all();
    }

    fn report_overflow(&self, owner: StreamHandle, channel: usize) {
        status_indicator("O");
        tracing::debug!(handle = %owner, channel, "rx overflow");
        self.push_event(
            owner,
            StreamResult::status(ErrorCode::Overflow).with_chan_mask(chan_mask(&[channel])),
        );
    }

    fn complex_setting(&self, direction: Direction, channel: usize, name: &str) -> Complex<f64> {
        Complex::new(
            self.inner.settings.get_or(&Self::key(direction, channel, &format!("{}:re", name)), 0.0),
            self.inner.settings.get_or(&Self::key(direction, channel, &format!("{}:im", name)), 0.0),
        )
    }

    fn set_complex_setting(&self, direction: Direction, channel: usize, name: &str, value: Complex<f64>) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        let settings = &self.inner.settings;
        settings.set(Self::key(direction, channel, &format!("{}:re", name)), value.re);
        settings.set(Self::key(direction, channel, &format!("{}:im", name)), value.im);
        Ok(())
    }

    fn gain_limit(name: &str) -> SdrResult<f64> {
        GAINS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, max)| *max)
            .ok_or_else(|| SdrError::InvalidArgument(format!("unknown gain element '{}'", name)))
    }
}

impl SdrDevice for LoopbackDevice {
    fn driver_key(&self) -> String {
        LOOPBACK_DRIVER.to_string()
    }

    fn hardware_key(&self) -> String {
        LOOPBACK_DRIVER.to_string()
    }

    fn hardware_info(&self) -> Kwargs {
        Kwargs::new()
            .with("serial", self.inner.serial.as_str())
            .with("origin", env!("CARGO_PKG_NAME"))
            .with("version", env!("CARGO_PKG_VERSION"))
    }

    fn num_channels(&self, _direction: Direction) -> usize {
        self.inner.channels
    }

    fn channel_info(&self, direction: Direction, channel: usize) -> Kwargs {
        Kwargs::new().with("name", format!("{}{}", direction, channel))
    }

    // ----- streams -----

    fn stream_formats(&self, direction: Direction, _channel: usize) -> Vec<StreamFormat> {
        let registry = converters().read().unwrap_or_else(PoisonError::into_inner);
        match direction {
            Direction::Rx => registry.list_target_formats(NATIVE_FORMAT),
            Direction::Tx => registry.list_source_formats(NATIVE_FORMAT),
        }
    }

    fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (StreamFormat, f64) {
        (NATIVE_FORMAT, 1.0)
    }

    fn stream_args_info(&self, direction: Direction, _channel: usize) -> Vec<ArgInfo> {
        let mut info = vec![
            ArgInfo::new("bufflen", ArgType::Int, DEFAULT_MTU.to_string())
                .describe("Buffer Length", "Maximum elements per transfer.")
                .units("elements")
                .range(Range::new(1.0, 65536.0)),
            ArgInfo::new("buffers", ArgType::Int, DEFAULT_BUFFERS.to_string())
                .describe("Buffer Count", "Receive FIFO depth in buffers.")
                .range(Range::new(1.0, 1024.0)),
        ];
        if direction == Direction::Rx {
            info.push(
                ArgInfo::new("rx_source", ArgType::String, "loopback")
                    .describe("Receive Source", "Where received samples come from.")
                    .options([("loopback", "Transmitted samples"), ("tone", "Generated tone")]),
            );
            info.push(
                ArgInfo::new("tone_freq", ArgType::Float, DEFAULT_TONE_FREQ.to_string())
                    .describe("Tone Frequency", "Offset of the generated tone.")
                    .units("Hz"),
            );
            info.push(
                ArgInfo::new("tone_ampl", ArgType::Float, DEFAULT_TONE_AMPL.to_string())
                    .describe("Tone Amplitude", "Amplitude of the generated tone.")
                    .range(Range::new(0.0, 1.0)),
            );
        }
        info
    }

    fn setup_stream(
        &self,
        direction: Direction,
        format: StreamFormat,
        channels: &[usize],
        args: &Kwargs,
    ) -> SdrResult<StreamHandle> {
        let convert = {
            let registry = converters().read().unwrap_or_else(PoisonError::into_inner);
            match direction {
                Direction::Rx => registry.function(NATIVE_FORMAT, format),
                Direction::Tx => registry.function(format, NATIVE_FORMAT),
            }
        };
        let convert = convert.map_err(|_| SdrError::UnsupportedFormat {
            format,
            direction,
            channel: channels.first().copied().unwrap_or(0),
        })?;
        if channels.is_empty() {
            return Err(SdrError::InvalidArgument("no channels selected".to_string()));
        }
        for &channel in channels {
            self.check_channel(direction, channel)?;
        }

        let mtu = parse_arg(args, "bufflen", DEFAULT_MTU)?;
        let depth = parse_arg(args, "buffers", DEFAULT_BUFFERS)?;
        if mtu == 0 || depth == 0 {
            return Err(SdrError::InvalidArgument(
                "bufflen and buffers must be at least 1".to_string(),
            ));
        }

        let source = match (direction, args.get("rx_source")) {
            (Direction::Tx, _) | (Direction::Rx, None) | (Direction::Rx, Some("loopback")) => RxSource::Loopback,
            (Direction::Rx, Some("tone")) => {
                let freq = parse_arg(args, "tone_freq", DEFAULT_TONE_FREQ)?;
                let amplitude = parse_arg(args, "tone_ampl", DEFAULT_TONE_AMPL)?;
                if !freq.is_finite() || !(0.0..=1.0).contains(&amplitude) {
                    return Err(SdrError::InvalidArgument(format!(
                        "invalid tone {} Hz at amplitude {}",
                        freq, amplitude
                    )));
                }
                RxSource::Tone { freq, amplitude }
            }
            (Direction::Rx, Some(other)) => {
                return Err(SdrError::InvalidArgument(format!("unknown rx_source '{}'", other)));
            }
        };

        let handle = StreamHandle::next();
        lock(&self.inner.streams).insert(
            handle,
            StreamEntry {
                direction,
                format,
                channels: channels.to_vec(),
                mtu,
                depth,
                source,
                active: false,
                events: VecDeque::new(),
                convert,
                pool: Vec::new(),
                addrs: Vec::new(),
            },
        );
        tracing::debug!(%handle, %direction, %format, ?channels, mtu, depth, "loopback stream created");
        Ok(handle)
    }

    fn close_stream(&self, handle: StreamHandle) -> SdrResult<()> {
        let entry = lock(&self.inner.streams)
            .remove(&handle)
            .ok_or_else(|| SdrError::NotFound(format!("{} is not open", handle)))?;
        if entry.direction == Direction::Rx {
            let mut rx = lock(&self.inner.rx);
            for &c in &entry.channels {
                if rx[c].owner == Some(handle) {
                    rx[c].release();
                }
            }
        }
        self.inner.rx_ready.notify_all();
        self.inner.events_ready.notify_all();
        Ok(())
    }

    fn stream_mtu(&self, handle: StreamHandle) -> usize {
        lock(&self.inner.streams)
            .get(&handle)
            .map_or(DEFAULT_MTU, |entry| entry.mtu)
    }

    /// `HAS_TIME` sets the timestamp of the first received sample. Burst
    /// lengths are enforced by the stream, so `END_BURST` is accepted.
    fn activate_stream(
        &self,
        handle: StreamHandle,
        flags: StreamFlags,
        time_ns: i64,
        _num_elems: usize,
    ) -> Result<(), ErrorCode> {
        if !(flags & !(StreamFlags::HAS_TIME | StreamFlags::END_BURST)).is_empty() {
            return Err(ErrorCode::NotSupported);
        }
        let (direction, channels, capacity, source) = {
            let mut streams = lock(&self.inner.streams);
            let entry = streams.get_mut(&handle).ok_or(ErrorCode::StreamError)?;
            entry.active = true;
            entry.events.clear();
            (
                entry.direction,
                entry.channels.clone(),
                entry.mtu.saturating_mul(entry.depth),
                entry.source,
            )
        };
        if direction == Direction::Rx {
            let rate = self.sample_rate(Direction::Rx, channels.first().copied().unwrap_or(0));
            let start_ns = if flags.contains(StreamFlags::HAS_TIME) {
                time_ns
            } else {
                self.now_ns()
            };
            let tick = time_ns_to_ticks(start_ns, rate).unwrap_or(0);
            let mut rx = lock(&self.inner.rx);
            for &c in &channels {
                let ch = &mut rx[c];
                ch.owner = Some(handle);
                ch.capacity = capacity;
                ch.next_tick = tick;
                ch.overflow = false;
                ch.tone = match source {
                    RxSource::Tone { freq, amplitude } => Some(ToneState {
                        step: TAU * freq / rate,
                        phase: 0.0,
                        amplitude,
                    }),
                    RxSource::Loopback => None,
                };
                let excess = ch.fifo.len().saturating_sub(capacity);
                ch.fifo.drain(..excess);
            }
        }
        tracing::debug!(%handle, %direction, ?flags, "loopback stream active");
        Ok(())
    }

    fn deactivate_stream(&self, handle: StreamHandle, flags: StreamFlags, _time_ns: i64) -> Result<(), ErrorCode> {
        if !(flags & !(StreamFlags::HAS_TIME | StreamFlags::END_BURST)).is_empty() {
            return Err(ErrorCode::NotSupported);
        }
        let (direction, channels) = {
            let mut streams = lock(&self.inner.streams);
            let entry = streams.get_mut(&handle).ok_or(ErrorCode::StreamError)?;
            entry.active = false;
            (entry.direction, entry.channels.clone())
        };
        if direction == Direction::Rx {
            let mut rx = lock(&self.inner.rx);
            for &c in &channels {
                if rx[c].owner == Some(handle) {
                    rx[c].release();
                }
            }
        }
        self.inner.rx_ready.notify_all();
        Ok(())
    }

    /// Waits up to `timeout_us` for samples on every channel of the stream.
    fn read_stream(
        &self,
        handle: StreamHandle,
        buffs: &mut [&mut [u8]],
        num_elems: usize,
        timeout_us: i64,
    ) -> StreamResult {
        let Some(info) = self.stream_info(handle, Direction::Rx) else {
            return StreamResult::status(ErrorCode::StreamError);
        };
        let wanted = num_elems.min(info.mtu);
        if wanted == 0 {
            return StreamResult::ok(0);
        }
        let rate = self.sample_rate(Direction::Rx, info.channels[0]);
        let deadline = deadline_after(timeout_us);

        let mut rx = lock(&self.inner.rx);
        loop {
            if info.channels.iter().any(|&c| rx[c].owner != Some(handle)) {
                return StreamResult::status(ErrorCode::StreamError);
            }
            if info.channels.iter().any(|&c| rx[c].overflow) {
                for &c in &info.channels {
                    rx[c].overflow = false;
                }
                return StreamResult::status(ErrorCode::Overflow);
            }
            for &c in &info.channels {
                rx[c].fill_tone(wanted);
            }

            let available = info.channels.iter().map(|&c| rx[c].fifo.len()).min().unwrap_or(0);
            if available > 0 {
                let n = available.min(wanted);
                let tick = rx[info.channels[0]].next_tick;
                let mut scratch = Vec::with_capacity(n);
                for (buf, &c) in buffs.iter_mut().zip(&info.channels) {
                    scratch.clear();
                    scratch.extend(rx[c].fifo.drain(..n));
                    rx[c].next_tick = rx[c].next_tick.saturating_add(n as i64);
                    (info.convert)(bytemuck::cast_slice(&scratch), &mut buf[..], n, 1.0);
                }
                let result = StreamResult::ok(n);
                return match ticks_to_time_ns(tick, rate) {
                    Ok(time_ns) => result.with_time(time_ns),
                    Err(_) => result,
                };
            }

            if info
                .channels
                .iter()
                .any(|&c| rx[c].end_of_stream && rx[c].fifo.is_empty())
            {
                return StreamResult::status(ErrorCode::EndOfStream);
            }
            let now = Instant::now();
            if now >= deadline {
                return StreamResult::status(ErrorCode::Timeout);
            }
            rx = self
                .inner
                .rx_ready
                .wait_timeout(rx, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Never blocks: the receive FIFO drops its oldest samples instead.
    fn write_stream(
        &self,
        handle: StreamHandle,
        buffs: &[&[u8]],
        num_elems: usize,
        flags: StreamFlags,
        time_ns: i64,
        _timeout_us: i64,
    ) -> StreamResult {
        let Some(info) = self.stream_info(handle, Direction::Tx) else {
            return StreamResult::status(ErrorCode::StreamError);
        };
        let n = num_elems.min(info.mtu);
        let mask = chan_mask(&info.channels);
        let now = self.now_ns();

        if flags.contains(StreamFlags::HAS_TIME) && time_ns < now {
            // late packets are dropped and reported as an event
            status_indicator("L");
            self.push_event(
                handle,
                StreamResult::status(ErrorCode::TimeError)
                    .with_time(time_ns)
                    .with_chan_mask(mask),
            );
        } else if n > 0 && self.inner.settings.get_or(LOOPBACK_SETTING, true) {
            let len = n * info.format.size();
            let mut overflowed = Vec::new();
            {
                let mut rx = lock(&self.inner.rx);
                let mut samples = Vec::with_capacity(n);
                for (buf, &c) in buffs.iter().zip(&info.channels) {
                    let ch = &mut rx[c];
                    let Some(owner) = ch.owner else {
                        continue;
                    };
                    if ch.tone.is_some() {
                        continue;
                    }
                    samples.clear();
                    samples.resize(n, Complex::default());
                    (info.convert)(&buf[..len.min(buf.len())], bytemuck::cast_slice_mut(&mut samples), n, 1.0);
                    if ch.push(&samples) {
                        overflowed.push((owner, c));
                    }
                }
            }
            self.inner.rx_ready.notify_all();
            for (owner, channel) in overflowed {
                self.report_overflow(owner, channel);
            }
        }

        if flags.contains(StreamFlags::END_BURST) {
            self.push_event(
                handle,
                StreamResult::status(ErrorCode::None)
                    .with_flags(StreamFlags::END_BURST)
                    .with_time(now)
                    .with_chan_mask(mask),
            );
        }
        StreamResult::ok(n)
    }

    fn read_stream_status(&self, handle: StreamHandle, timeout_us: i64) -> StreamResult {
        let deadline = deadline_after(timeout_us);
        let mut streams = lock(&self.inner.streams);
        loop {
            let Some(entry) = streams.get_mut(&handle) else {
                return StreamResult::status(ErrorCode::StreamError);
            };
            if let Some(event) = entry.events.pop_front() {
                return event;
            }
            let now = Instant::now();
            if now >= deadline {
                return StreamResult::status(ErrorCode::Timeout);
            }
            streams = self
                .inner
                .events_ready
                .wait_timeout(streams, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // ----- direct buffer access -----

    fn num_direct_access_buffers(&self, handle: StreamHandle) -> usize {
        lock(&self.inner.streams)
            .get(&handle)
            .map_or(0, |entry| entry.depth)
    }

    fn direct_access_buffer_addrs(&self, handle: StreamHandle, index: usize) -> Result<Vec<usize>, ErrorCode> {
        let mut streams = lock(&self.inner.streams);
        let entry = streams.get_mut(&handle).ok_or(ErrorCode::StreamError)?;
        entry.pool();
        entry.addrs.get(index).cloned().ok_or(ErrorCode::StreamError)
    }

    /// Fills a pool buffer from the receive FIFO as [`read_stream`] would.
    ///
    /// [`read_stream`]: SdrDevice::read_stream
    fn acquire_read_buffer(&self, handle: StreamHandle, timeout_us: i64) -> Result<DirectBuffer, StreamResult> {
        let mut buffer = self.take_buffer(handle)?;
        let result = {
            let mut buffs: Vec<&mut [u8]> = buffer.buffs.iter_mut().map(Vec::as_mut_slice).collect();
            self.read_stream(handle, &mut buffs, buffer.num_elems, timeout_us)
        };
        if !result.is_ok() {
            self.return_buffer(handle, buffer);
            return Err(result);
        }
        buffer.num_elems = result.num_elems;
        buffer.flags = result.flags;
        buffer.time_ns = result.time_ns;
        Ok(buffer)
    }

    fn release_read_buffer(&self, handle: StreamHandle, buffer: DirectBuffer) {
        self.return_buffer(handle, buffer);
    }

    fn acquire_write_buffer(&self, handle: StreamHandle, _timeout_us: i64) -> Result<DirectBuffer, StreamResult> {
        if self.stream_info(handle, Direction::Tx).is_none() {
            return Err(StreamResult::status(ErrorCode::StreamError));
        }
        self.take_buffer(handle)
    }

    /// Sends the buffer through [`write_stream`](SdrDevice::write_stream),
    /// then returns it to the pool.
    fn release_write_buffer(
        &self,
        handle: StreamHandle,
        buffer: DirectBuffer,
        num_elems: usize,
        flags: StreamFlags,
        time_ns: i64,
    ) -> StreamResult {
        let result = {
            let buffs: Vec<&[u8]> = buffer.buffs.iter().map(Vec::as_slice).collect();
            self.write_stream(handle, &buffs, num_elems, flags, time_ns, 0)
        };
        self.return_buffer(handle, buffer);
        result
    }

    // ----- antennas and corrections -----

    fn list_antennas(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec![ANTENNA.to_string()]
    }

    fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        if name != ANTENNA {
            return Err(SdrError::InvalidArgument(format!("unknown antenna '{}'", name)));
        }
        self.inner.settings.set(Self::key(direction, channel, "antenna"), name);
        Ok(())
    }

    fn antenna(&self, direction: Direction, channel: usize) -> String {
        self.inner
            .settings
            .get(&Self::key(direction, channel, "antenna"))
            .unwrap_or_else(|| ANTENNA.to_string())
    }

    fn has_dc_offset_mode(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    fn set_dc_offset_mode(&self, direction: Direction, channel: usize, automatic: bool) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        self.inner.settings.set(Self::key(direction, channel, "dc_auto"), automatic);
        Ok(())
    }

    fn dc_offset_mode(&self, direction: Direction, channel: usize) -> bool {
        self.inner.settings.get_or(&Self::key(direction, channel, "dc_auto"), false)
    }

    fn set_dc_offset(&self, direction: Direction, channel: usize, offset: Complex<f64>) -> SdrResult<()> {
        self.set_complex_setting(direction, channel, "dc_offset", offset)
    }

    fn dc_offset(&self, direction: Direction, channel: usize) -> Complex<f64> {
        self.complex_setting(direction, channel, "dc_offset")
    }

    fn set_iq_balance(&self, direction: Direction, channel: usize, balance: Complex<f64>) -> SdrResult<()> {
        self.set_complex_setting(direction, channel, "iq_balance", balance)
    }

    fn iq_balance(&self, direction: Direction, channel: usize) -> Complex<f64> {
        self.complex_setting(direction, channel, "iq_balance")
    }

    fn set_frequency_correction(&self, direction: Direction, channel: usize, ppm: f64) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        self.inner.settings.set(Self::key(direction, channel, "ppm"), ppm);
        Ok(())
    }

    fn frequency_correction(&self, direction: Direction, channel: usize) -> f64 {
        self.inner.settings.get_or(&Self::key(direction, channel, "ppm"), 0.0)
    }

    // ----- gain -----

    fn list_gains(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        GAINS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn has_gain_mode(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    fn set_gain_mode(&self, direction: Direction, channel: usize, automatic: bool) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        self.inner.settings.set(Self::key(direction, channel, "agc"), automatic);
        Ok(())
    }

    fn gain_mode(&self, direction: Direction, channel: usize) -> bool {
        self.inner.settings.get_or(&Self::key(direction, channel, "agc"), false)
    }

    /// Fills the elements in order, each up to its maximum.
    fn set_gain(&self, direction: Direction, channel: usize, gain_db: f64) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        let mut remaining = self.gain_range(direction, channel).clip(gain_db);
        for (name, max) in GAINS {
            let element = remaining.min(max);
            self.set_gain_element(direction, channel, name, element)?;
            remaining -= element;
        }
        Ok(())
    }

    fn set_gain_element(&self, direction: Direction, channel: usize, name: &str, gain_db: f64) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        let max = Self::gain_limit(name)?;
        let value = Range::new(0.0, max).clip(gain_db);
        self.inner
            .settings
            .set(Self::key(direction, channel, &format!("gain:{}", name)), value);
        Ok(())
    }

    fn gain_element(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        self.inner
            .settings
            .get_or(&Self::key(direction, channel, &format!("gain:{}", name)), 0.0)
    }

    fn gain_range(&self, _direction: Direction, _channel: usize) -> Range {
        Range::new(0.0, GAINS.iter().map(|(_, max)| max).sum())
    }

    fn gain_element_range(&self, _direction: Direction, _channel: usize, name: &str) -> Range {
        Self::gain_limit(name).map_or_else(|_| Range::default(), |max| Range::new(0.0, max))
    }

    // ----- frequency -----

    fn set_frequency(&self, direction: Direction, channel: usize, frequency: f64, args: &Kwargs) -> SdrResult<()> {
        self.set_frequency_component(direction, channel, RF_COMPONENT, frequency, args)
    }

    fn frequency(&self, direction: Direction, channel: usize) -> f64 {
        self.frequency_component(direction, channel, RF_COMPONENT)
    }

    fn list_frequencies(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec![RF_COMPONENT.to_string()]
    }

    fn set_frequency_component(
        &self,
        direction: Direction,
        channel: usize,
        name: &str,
        frequency: f64,
        _args: &Kwargs,
    ) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        if name != RF_COMPONENT {
            return Err(SdrError::InvalidArgument(format!("unknown frequency component '{}'", name)));
        }
        let range = Range::new(0.0, 6e9);
        if !range.contains(frequency) {
            return Err(SdrError::InvalidArgument(format!("frequency {} Hz out of range {}", frequency, range)));
        }
        self.inner
            .settings
            .set(Self::key(direction, channel, &format!("freq:{}", name)), frequency);
        Ok(())
    }

    fn frequency_component(&self, direction: Direction, channel: usize, name: &str) -> f64 {
        self.inner
            .settings
            .get_or(&Self::key(direction, channel, &format!("freq:{}", name)), 0.0)
    }

    fn frequency_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(0.0, 6e9)]
    }

    // ----- sample rate and bandwidth -----

    fn set_sample_rate(&self, direction: Direction, channel: usize, rate: f64) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        if !self.sample_rate_range(direction, channel).iter().any(|r| r.contains(rate)) {
            return Err(SdrError::InvalidArgument(format!("sample rate {} not supported", rate)));
        }
        self.inner.settings.set(Self::key(direction, channel, "rate"), rate);
        Ok(())
    }

    fn sample_rate(&self, direction: Direction, channel: usize) -> f64 {
        self.inner
            .settings
            .get_or(&Self::key(direction, channel, "rate"), DEFAULT_SAMPLE_RATE)
    }

    fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(1e3, MASTER_CLOCK_RATE)]
    }

    fn set_bandwidth(&self, direction: Direction, channel: usize, bandwidth: f64) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        if !(bandwidth.is_finite() && bandwidth >= 0.0) {
            return Err(SdrError::InvalidArgument(format!("bandwidth {} not supported", bandwidth)));
        }
        self.inner.settings.set(Self::key(direction, channel, "bw"), bandwidth);
        Ok(())
    }

    /// Defaults to the sample rate.
    fn bandwidth(&self, direction: Direction, channel: usize) -> f64 {
        let rate = self.sample_rate(direction, channel);
        self.inner.settings.get_or(&Self::key(direction, channel, "bw"), rate)
    }

    fn bandwidth_range(&self, _direction: Direction, _channel: usize) -> Vec<Range> {
        vec![Range::new(0.0, MASTER_CLOCK_RATE)]
    }

    // ----- clocking and time -----

    fn set_master_clock_rate(&self, rate: f64) -> SdrResult<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(SdrError::InvalidArgument(format!("clock rate {} not supported", rate)));
        }
        self.inner.settings.set("master_clock", rate);
        Ok(())
    }

    fn master_clock_rate(&self) -> f64 {
        self.inner.settings.get_or("master_clock", MASTER_CLOCK_RATE)
    }

    fn list_clock_sources(&self) -> Vec<String> {
        CLOCK_SOURCES.iter().map(|s| s.to_string()).collect()
    }

    fn set_clock_source(&self, source: &str) -> SdrResult<()> {
        if !CLOCK_SOURCES.contains(&source) {
            return Err(SdrError::InvalidArgument(format!("unknown clock source '{}'", source)));
        }
        self.inner.settings.set("clock_source", source);
        Ok(())
    }

    fn clock_source(&self) -> String {
        self.inner
            .settings
            .get("clock_source")
            .unwrap_or_else(|| CLOCK_SOURCES[0].to_string())
    }

    fn list_time_sources(&self) -> Vec<String> {
        TIME_SOURCES.iter().map(|s| s.to_string()).collect()
    }

    fn set_time_source(&self, source: &str) -> SdrResult<()> {
        if !TIME_SOURCES.contains(&source) {
            return Err(SdrError::InvalidArgument(format!("unknown time source '{}'", source)));
        }
        self.inner.settings.set("time_source", source);
        Ok(())
    }

    fn time_source(&self) -> String {
        self.inner
            .settings
            .get("time_source")
            .unwrap_or_else(|| TIME_SOURCES[0].to_string())
    }

    fn has_hardware_time(&self, what: &str) -> bool {
        what.is_empty()
    }

    fn hardware_time(&self, _what: &str) -> i64 {
        self.now_ns()
    }

    fn set_hardware_time(&self, time_ns: i64, what: &str) -> SdrResult<()> {
        if !what.is_empty() {
            return Err(SdrError::NotFound(format!("no time counter '{}'", what)));
        }
        let mut clock = lock(&self.inner.clock);
        clock.base_ns = time_ns;
        clock.since = Instant::now();
        Ok(())
    }

    // ----- sensors -----

    fn list_sensors(&self) -> Vec<String> {
        vec!["clock_locked".to_string(), "temperature".to_string()]
    }

    fn sensor_info(&self, key: &str) -> ArgInfo {
        match key {
            "clock_locked" => ArgInfo::new(key, ArgType::Bool, "true").describe("Clock Locked", "Reference clock lock."),
            "temperature" => ArgInfo::new(key, ArgType::Float, "25.0")
                .describe("Temperature", "Board temperature.")
                .units("C"),
            _ => ArgInfo::new(key, ArgType::String, ""),
        }
    }

    fn read_sensor(&self, key: &str) -> SdrResult<String> {
        match key {
            "clock_locked" => Ok("true".to_string()),
            "temperature" => Ok("25.0".to_string()),
            _ => Err(SdrError::NotFound(format!("no sensor '{}'", key))),
        }
    }

    fn list_channel_sensors(&self, _direction: Direction, _channel: usize) -> Vec<String> {
        vec!["lo_locked".to_string()]
    }

    fn read_channel_sensor(&self, direction: Direction, channel: usize, key: &str) -> SdrResult<String> {
        self.check_channel(direction, channel)?;
        match key {
            "lo_locked" => Ok("true".to_string()),
            _ => Err(SdrError::NotFound(format!("no sensor '{}'", key))),
        }
    }

    // ----- settings -----

    fn setting_info(&self) -> Vec<ArgInfo> {
        vec![ArgInfo::new(LOOPBACK_SETTING, ArgType::Bool, "true")
            .describe("Loopback", "Route transmitted samples to the receive side.")]
    }

    fn write_setting(&self, key: &str, value: &str) -> SdrResult<()> {
        if key == LOOPBACK_SETTING && value.parse::<bool>().is_err() {
            return Err(SdrError::InvalidArgument(format!("{} expects true or false", key)));
        }
        self.inner.settings.set(key, value);
        Ok(())
    }

    fn read_setting(&self, key: &str) -> SdrResult<String> {
        match self.inner.settings.get(key) {
            Some(value) => Ok(value),
            None if key == LOOPBACK_SETTING => Ok("true".to_string()),
            None => Err(SdrError::NotFound(format!("no setting '{}'", key))),
        }
    }

    /// Channel settings are free-form; the ones written so far are listed.
    fn channel_setting_info(&self, direction: Direction, channel: usize) -> Vec<ArgInfo> {
        let prefix = Self::key(direction, channel, "setting:");
        self.inner
            .settings
            .keys_with_prefix(&prefix)
            .into_iter()
            .filter_map(|key| {
                let value = self.inner.settings.get(&key)?;
                Some(ArgInfo::new(&key[prefix.len()..], ArgType::String, value))
            })
            .collect()
    }

    fn write_channel_setting(&self, direction: Direction, channel: usize, key: &str, value: &str) -> SdrResult<()> {
        self.check_channel(direction, channel)?;
        self.inner
            .settings
            .set(Self::key(direction, channel, &format!("setting:{}", key)), value);
        Ok(())
    }

    fn read_channel_setting(&self, direction: Direction, channel: usize, key: &str) -> SdrResult<String> {
        self.check_channel(direction, channel)?;
        self.inner
            .settings
            .get(&Self::key(direction, channel, &format!("setting:{}", key)))
            .ok_or_else(|| SdrError::NotFound(format!("no setting '{}'", key)))
    }

    // ----- registers and GPIO -----

    fn list_register_interfaces(&self) -> Vec<String> {
        vec![REGISTER_IFACE.to_string()]
    }

    fn write_register(&self, name: &str, addr: u32, value: u32) -> SdrResult<()> {
        if name != REGISTER_IFACE {
            return Err(SdrError::NotFound(format!("no register interface '{}'", name)));
        }
        self.inner.settings.set(format!("reg:{}:{:#x}", name, addr), value);
        Ok(())
    }

    fn read_register(&self, name: &str, addr: u32) -> SdrResult<u32> {
        if name != REGISTER_IFACE {
            return Err(SdrError::NotFound(format!("no register interface '{}'", name)));
        }
        Ok(self.inner.settings.get_or(&format!("reg:{}:{:#x}", name, addr), 0))
    }

    fn list_gpio_banks(&self) -> Vec<String> {
        vec![GPIO_BANK.to_string()]
    }

    fn write_gpio(&self, bank: &str, value: u32) -> SdrResult<()> {
        if bank != GPIO_BANK {
            return Err(SdrError::NotFound(format!("no GPIO bank '{}'", bank)));
        }
        self.inner.settings.set(format!("gpio:{}", bank), value);
        Ok(())
    }

    fn read_gpio(&self, bank: &str) -> SdrResult<u32> {
        if bank != GPIO_BANK {
            return Err(SdrError::NotFound(format!("no GPIO bank '{}'", bank)));
        }
        Ok(self.inner.settings.get_or(&format!("gpio:{}", bank), 0))
    }

    fn write_gpio_dir(&self, bank: &str, dir: u32) -> SdrResult<()> {
        if bank != GPIO_BANK {
            return Err(SdrError::NotFound(format!("no GPIO bank '{}'", bank)));
        }
        self.inner.settings.set(format!("gpio_dir:{}", bank), dir);
        Ok(())
    }

    fn read_gpio_dir(&self, bank: &str) -> SdrResult<u32> {
        if bank != GPIO_BANK {
            return Err(SdrError::NotFound(format!("no GPIO bank '{}'", bank)));
        }
        Ok(self.inner.settings.get_or(&format!("gpio_dir:{}", bank), 0))
    }

    // ----- buses: written bytes read back -----

    fn write_i2c(&self, addr: u32, data: &[u8]) -> SdrResult<()> {
        lock(&self.inner.i2c)
            .entry(addr)
            .or_default()
            .extend(data.iter().copied());
        Ok(())
    }

    fn read_i2c(&self, addr: u32, num_bytes: usize) -> SdrResult<Vec<u8>> {
        let mut i2c = lock(&self.inner.i2c);
        let Some(pending) = i2c.get_mut(&addr) else {
            return Ok(Vec::new());
        };
        let n = num_bytes.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    fn transact_spi(&self, _addr: u32, data: u32, num_bits: usize) -> SdrResult<u32> {
        if num_bits >= 32 {
            Ok(data)
        } else {
            Ok(data & ((1u32 << num_bits) - 1))
        }
    }

    fn list_uarts(&self) -> Vec<String> {
        vec![UART.to_string()]
    }

    fn write_uart(&self, which: &str, data: &str) -> SdrResult<()> {
        if which != UART {
            return Err(SdrError::NotFound(format!("no UART '{}'", which)));
        }
        lock(&self.inner.uart).push_str(data);
        Ok(())
    }

    fn read_uart(&self, which: &str, _timeout_us: i64) -> SdrResult<String> {
        if which != UART {
            return Err(SdrError::NotFound(format!("no UART '{}'", which)));
        }
        Ok(std::mem::take(&mut *lock(&self.inner.uart)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdrstream_core::{Device, StreamState};
    use std::thread;

    fn loopback() -> (LoopbackDevice, Device) {
        let lb = LoopbackDevice::new("test", 2);
        let device = Device::new(lb.clone());
        (lb, device)
    }

    fn ramp(n: usize) -> Vec<Complex<f32>> {
        (0..n)
            .map(|i| Complex::new(i as f32 / n as f32, -(i as f32) / n as f32))
            .collect()
    }

    #[test]
    fn test_driver_find_and_make() {
        let driver = LoopbackDriver::new();
        let found = driver.find(&Kwargs::from("serial=7"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("serial"), Some("7"));
        assert!(driver.find(&Kwargs::from("type=null")).is_empty());

        let dev = driver.make(&Kwargs::from("channels=4")).unwrap();
        assert_eq!(dev.num_channels(Direction::Rx), 4);
        assert!(driver.make(&Kwargs::from("channels=0")).is_err());
        assert!(driver.make(&Kwargs::from("channels=many")).is_err());
    }

    #[test]
    fn test_tx_to_rx_across_formats() {
        let (_lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, StreamFormat::CS16, &[0], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();

        let sent: Vec<i16> = (0..200).map(|i| (i * 100) as i16).collect();
        let result = tx.write(&[&sent[..]], StreamFlags::NONE, 0, 100_000).unwrap();
        assert_eq!(result.num_elems, 100);

        let mut buf = vec![Complex::new(0.0f32, 0.0); 256];
        let result = rx.read(&mut [&mut buf[..]], 100_000).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.num_elems, 100);
        assert!(result.time().is_some());
        for (i, s) in buf[..100].iter().enumerate() {
            let expect = Complex::new(sent[2 * i] as f32 / 32767.0, sent[2 * i + 1] as f32 / 32767.0);
            assert!((s - expect).norm() < 1e-6);
        }
    }

    #[test]
    fn test_stream_formats_follow_converters() {
        let (_lb, device) = loopback();
        let rx = device.stream_formats(Direction::Rx, 0);
        let tx = device.stream_formats(Direction::Tx, 0);
        for format in [StreamFormat::CF64, StreamFormat::CF32, StreamFormat::CS16, StreamFormat::CU8] {
            assert!(rx.contains(&format), "rx {}", format);
            assert!(tx.contains(&format), "tx {}", format);
        }
        assert!(!rx.contains(&StreamFormat::CS12));
        assert!(!tx.contains(&StreamFormat::F32));

        let err = device
            .setup_stream(Direction::Tx, StreamFormat::CS12, &[0], &Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, SdrError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_read_timeout_when_idle() {
        let (_lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[1], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        let mut buf = vec![Complex::new(0.0f32, 0.0); 16];
        let start = Instant::now();
        let result = rx.read(&mut [&mut buf[..]], 20_000).unwrap();
        assert_eq!(result.status, ErrorCode::Timeout);
        assert_eq!(result.num_elems, 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocked_read_wakes_on_write() {
        let (_lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let samples = ramp(32);
            tx.write(&[&samples[..]], StreamFlags::NONE, 0, 100_000).unwrap()
        });
        let mut buf = vec![Complex::new(0.0f32, 0.0); 64];
        let result = rx.read(&mut [&mut buf[..]], 2_000_000).unwrap();
        assert_eq!(result.num_elems, 32);
        assert_eq!(&buf[..32], &ramp(32)[..]);
        assert_eq!(writer.join().unwrap().num_elems, 32);
    }

    #[test]
    fn test_timestamps_follow_sample_counter() {
        let (lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::HAS_TIME, 1_000_000, 0).unwrap();
        lb.inject(0, &ramp(300), false).unwrap();

        let mut buf = vec![Complex::new(0.0f32, 0.0); 100];
        let first = rx.read(&mut [&mut buf[..]], 0).unwrap();
        let second = rx.read(&mut [&mut buf[..]], 0).unwrap();
        assert_eq!(first.time(), Some(1_000_000));
        // 100 samples at 1 MS/s
        assert_eq!(second.time(), Some(1_100_000));
    }

    #[test]
    fn test_multichannel_read() {
        let (lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0, 1], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        lb.inject(0, &ramp(40), false).unwrap();
        lb.inject(1, &ramp(25), false).unwrap();

        let mut a = vec![Complex::new(0.0f32, 0.0); 64];
        let mut b = vec![Complex::new(0.0f32, 0.0); 64];
        let result = rx.read(&mut [&mut a[..], &mut b[..]], 0).unwrap();
        // limited by the channel with the least data
        assert_eq!(result.num_elems, 25);
    }

    #[test]
    fn test_overflow_reported_once() {
        let (lb, device) = loopback();
        let args = Kwargs::from("bufflen=16, buffers=2");
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &args)
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        assert_eq!(rx.mtu().unwrap(), 16);

        let samples = ramp(50);
        lb.inject(0, &samples, false).unwrap();

        let mut buf = vec![Complex::new(0.0f32, 0.0); 16];
        let result = rx.read(&mut [&mut buf[..]], 0).unwrap();
        assert_eq!(result.status, ErrorCode::Overflow);
        assert_eq!(result.num_elems, 0);

        // oldest dropped, newest 32 kept
        let result = rx.read(&mut [&mut buf[..]], 0).unwrap();
        assert_eq!(result.num_elems, 16);
        assert_eq!(buf[0], samples[18]);

        let status = rx.read_status(0).unwrap();
        assert_eq!(status.status, ErrorCode::Overflow);
        assert_eq!(status.chan_mask, 0b1);
    }

    #[test]
    fn test_end_of_stream() {
        let (lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CS8, &[0], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        lb.inject(0, &ramp(10), true).unwrap();

        let mut buf = vec![0i8; 64];
        let result = rx.read(&mut [&mut buf[..]], 100_000).unwrap();
        assert_eq!(result.num_elems, 10);
        let result = rx.read(&mut [&mut buf[..]], 100_000).unwrap();
        assert_eq!(result.status, ErrorCode::EndOfStream);
    }

    #[test]
    fn test_tone_source() {
        let (_lb, device) = loopback();
        let args = Kwargs::from("rx_source=tone, tone_freq=250000, tone_ampl=0.5");
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &args)
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        let mut buf = vec![Complex::new(0.0f32, 0.0); 8];
        let result = rx.read(&mut [&mut buf[..]], 0).unwrap();
        assert_eq!(result.num_elems, 8);
        // quarter of the sample rate: one turn every four samples
        assert!((buf[0] - Complex::new(0.5, 0.0)).norm() < 1e-5);
        assert!((buf[1] - Complex::new(0.0, 0.5)).norm() < 1e-5);
        assert!((buf[4] - buf[0]).norm() < 1e-5);

        let bad = device.setup_stream(Direction::Rx, StreamFormat::CF32, &[1], &Kwargs::from("rx_source=noise"));
        assert!(matches!(bad, Err(SdrError::InvalidArgument(_))));
    }

    #[test]
    fn test_late_packet_and_burst_events() {
        let (_lb, device) = loopback();
        device.set_hardware_time(5_000_000_000, "").unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, StreamFormat::CF32, &[1], &Kwargs::new())
            .unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();
        assert_eq!(tx.read_status(0).unwrap().status, ErrorCode::Timeout);

        let samples = ramp(10);
        tx.write(&[&samples[..]], StreamFlags::HAS_TIME, 1_000, 100_000).unwrap();
        let late = tx.read_status(0).unwrap();
        assert_eq!(late.status, ErrorCode::TimeError);
        assert_eq!(late.time(), Some(1_000));
        assert_eq!(late.chan_mask, 0b10);

        tx.write(&[&samples[..]], StreamFlags::END_BURST, 0, 100_000).unwrap();
        let ack = tx.read_status(0).unwrap();
        assert!(ack.is_ok());
        assert!(ack.flags.contains(StreamFlags::END_BURST));
    }

    #[test]
    fn test_bounded_burst_deactivates() {
        let (lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        lb.inject(0, &ramp(100), false).unwrap();
        rx.activate(StreamFlags::END_BURST, 0, 60).unwrap();
        let mut buf = vec![Complex::new(0.0f32, 0.0); 100];
        let result = rx.read(&mut [&mut buf[..]], 0).unwrap();
        assert_eq!(result.num_elems, 60);
        assert!(result.flags.contains(StreamFlags::END_BURST));
        assert_eq!(rx.state(), StreamState::Inactive);
    }

    #[test]
    fn test_tx_burst_longer_than_mtu_acks_once() {
        let (_lb, device) = loopback();
        let mut tx = device
            .setup_stream(Direction::Tx, StreamFormat::CF32, &[0], &Kwargs::from("bufflen=1024"))
            .unwrap();
        tx.activate(StreamFlags::NONE, 0, 2000).unwrap();
        let samples = ramp(2000);

        let first = tx.write(&[&samples[..]], StreamFlags::NONE, 0, 100_000).unwrap();
        assert_eq!(first.num_elems, 1024);
        assert!(!first.flags.contains(StreamFlags::END_BURST));
        assert_eq!(tx.read_status(0).unwrap().status, ErrorCode::Timeout);

        let rest = tx
            .write(&[&samples[1024..]], StreamFlags::NONE, 0, 100_000)
            .unwrap();
        assert_eq!(rest.num_elems, 976);
        assert!(rest.flags.contains(StreamFlags::END_BURST));
        assert_eq!(tx.state(), StreamState::Inactive);

        // the burst ack is still readable after the stream went inactive
        let ack = tx.read_status(0).unwrap();
        assert!(ack.is_ok());
        assert!(ack.flags.contains(StreamFlags::END_BURST));
        assert_eq!(tx.read_status(0).unwrap().status, ErrorCode::Timeout);
    }

    #[test]
    fn test_direct_access_round_trip() {
        let (_lb, device) = loopback();
        let args = Kwargs::from("bufflen=64, buffers=4");
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CS16, &[0], &args)
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, StreamFormat::CF32, &[0], &args)
            .unwrap();
        assert_eq!(tx.num_direct_access_buffers(), Ok(4));
        let addrs: Vec<Vec<usize>> = (0..4)
            .map(|i| tx.direct_access_buffer_addrs(i).unwrap())
            .collect();
        assert!(addrs.iter().all(|a| a.len() == 1));
        assert!(tx.direct_access_buffer_addrs(4).is_err());
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();

        let sent = vec![Complex::new(0.5f32, -0.25); 10];
        let mut buf = tx.acquire_write_buffer(0).unwrap();
        assert_eq!(buf.capacity(), 64);
        let index = buf.index().unwrap();
        let wire = buf.channel_mut(0);
        assert_eq!(wire.as_ptr() as usize, addrs[index][0]);
        wire[..80].copy_from_slice(bytemuck::cast_slice(&sent));
        let result = buf.submit(10, StreamFlags::NONE, 0).unwrap();
        assert_eq!(result.num_elems, 10);

        let buf = rx.acquire_read_buffer(100_000).unwrap();
        assert!(buf.result().is_ok());
        assert_eq!(buf.num_elems(), 10);
        assert!(buf.result().time().is_some());
        assert_eq!(buf.channel(0).len(), 40);
        let first: [i16; 2] = bytemuck::pod_read_unaligned(&buf.channel(0)[..4]);
        assert_eq!(first, [16383, -8191]);
        let index = buf.index().unwrap();
        let addr = buf.channel(0).as_ptr() as usize;
        drop(buf);
        assert_eq!(rx.direct_access_buffer_addrs(index), Ok(vec![addr]));

        let idle = rx.acquire_read_buffer(0).unwrap();
        assert_eq!(idle.result().status, ErrorCode::Timeout);
        assert_eq!(idle.index(), None);
        assert!(idle.channel(0).is_empty());
    }

    #[test]
    fn test_direct_access_pool_reuse() {
        let (lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::from("bufflen=8, buffers=2"))
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        let samples = ramp(40);
        // more reads than pool slots, each guard returns its buffer
        for (round, chunk) in samples.chunks(8).enumerate() {
            lb.inject(0, chunk, false).unwrap();
            let buf = rx.acquire_read_buffer(0).unwrap();
            assert_eq!(buf.num_elems(), 8, "round {}", round);
            let first: Complex<f32> = bytemuck::pod_read_unaligned(&buf.channel(0)[..8]);
            assert_eq!(first, chunk[0]);
        }
    }

    #[test]
    fn test_loopback_setting_disables_routing() {
        let (_lb, device) = loopback();
        assert_eq!(device.read_setting("loopback").unwrap(), "true");
        device.write_setting("loopback", "false").unwrap();
        assert!(device.write_setting("loopback", "maybe").is_err());

        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        let mut tx = device
            .setup_stream(Direction::Tx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        rx.activate(StreamFlags::NONE, 0, 0).unwrap();
        tx.activate(StreamFlags::NONE, 0, 0).unwrap();
        let samples = ramp(8);
        tx.write(&[&samples[..]], StreamFlags::NONE, 0, 0).unwrap();
        let mut buf = vec![Complex::new(0.0f32, 0.0); 8];
        assert_eq!(rx.read(&mut [&mut buf[..]], 0).unwrap().status, ErrorCode::Timeout);
    }

    #[test]
    fn test_unsupported_activation_flags() {
        let (_lb, device) = loopback();
        let mut rx = device
            .setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())
            .unwrap();
        let err = rx.activate(StreamFlags::WAIT_TRIGGER, 0, 0).unwrap_err();
        assert_eq!(err, SdrError::Status(ErrorCode::NotSupported));
    }

    #[test]
    fn test_frontend_settings() {
        let (_lb, device) = loopback();
        device.set_gain(Direction::Rx, 0, 45.0).unwrap();
        assert_eq!(device.gain_element(Direction::Rx, 0, "LNA"), 30.0);
        assert_eq!(device.gain_element(Direction::Rx, 0, "PGA"), 15.0);
        assert_eq!(device.gain(Direction::Rx, 0), 45.0);
        assert!(device.set_gain_element(Direction::Rx, 0, "VGA", 1.0).is_err());

        device.set_frequency(Direction::Tx, 1, 915e6, &Kwargs::new()).unwrap();
        assert_eq!(device.frequency(Direction::Tx, 1), 915e6);
        assert_eq!(device.frequency(Direction::Rx, 1), 0.0);
        assert!(device.set_frequency(Direction::Tx, 2, 915e6, &Kwargs::new()).is_err());

        device.set_sample_rate(Direction::Rx, 0, 2e6).unwrap();
        assert_eq!(device.sample_rate(Direction::Rx, 0), 2e6);
        assert_eq!(device.bandwidth(Direction::Rx, 0), 2e6);
        assert!(device.set_sample_rate(Direction::Rx, 0, -1.0).is_err());

        device.set_dc_offset(Direction::Rx, 0, Complex::new(0.1, -0.2)).unwrap();
        assert_eq!(device.dc_offset(Direction::Rx, 0), Complex::new(0.1, -0.2));

        device.write_channel_setting(Direction::Rx, 1, "lo_mode", "fixed").unwrap();
        assert_eq!(device.read_channel_setting(Direction::Rx, 1, "lo_mode").unwrap(), "fixed");
        let info = device.channel_setting_info(Direction::Rx, 1);
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].key, "lo_mode");
        assert!(device.channel_setting_info(Direction::Tx, 1).is_empty());

        assert!(device.set_clock_source("gps").is_err());
        device.set_clock_source("external").unwrap();
        assert_eq!(device.clock_source(), "external");
    }

    #[test]
    fn test_registers_and_buses() {
        let (_lb, device) = loopback();
        device.write_register("FPGA", 0x10, 0xdead).unwrap();
        assert_eq!(device.read_register("FPGA", 0x10).unwrap(), 0xdead);
        assert!(device.read_register("CPLD", 0).is_err());

        device.write_gpio("MAIN", 0xf0).unwrap();
        device.write_gpio_masked("MAIN", 0x0f, 0x3c).unwrap();
        assert_eq!(device.read_gpio("MAIN").unwrap(), 0xcc);

        device.write_i2c(0x50, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_i2c(0x50, 2).unwrap(), vec![1, 2]);
        assert_eq!(device.read_i2c(0x50, 8).unwrap(), vec![3]);

        assert_eq!(device.transact_spi(0, 0x1ff, 8).unwrap(), 0xff);

        device.write_uart("console", "hello").unwrap();
        assert_eq!(device.read_uart("console", 0).unwrap(), "hello");
        assert_eq!(device.read_uart("console", 0).unwrap(), "");
    }

    #[test]
    fn test_hardware_time() {
        let (_lb, device) = loopback();
        assert!(device.has_hardware_time(""));
        device.set_hardware_time(10_000_000_000, "").unwrap();
        let now = device.hardware_time("");
        assert!(now >= 10_000_000_000);
        assert!(now < 11_000_000_000);
        assert!(device.set_hardware_time(0, "pps").is_err());
    }
}
