//! sdrstream command-line interface
//!
//! Tools for exercising SDR devices through the streaming API:
//! - Enumerating and probing devices
//! - Measuring stream throughput
//! - Recording received samples to a file
//! - Transmitting a test tone
//!
//! Device args use the `key=value, key=value` markup. When omitted, the
//! `device.args` entry of the configuration file is used.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use num_complex::Complex;
use sdrstream_core::observe::{init_logging, LogLevel};
use sdrstream_core::{
    Device, Direction, DriverRegistry, ErrorCode, Kwargs, SdrStreamConfig, Stream, StreamFlags, StreamFormat,
    StreamResult, StreamState,
};
use std::f32::consts::TAU;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sdrstream")]
#[command(author, version, about = "SDR streaming tools", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device profile from the configuration file
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate devices matching the args
    Find {
        /// Device filter, e.g. "driver=loopback"
        #[arg(default_value = "")]
        args: String,
    },

    /// Print the capabilities of a device
    Info {
        /// Device args
        args: Option<String>,
    },

    /// Measure streaming throughput
    Rate {
        /// Device args
        args: Option<String>,

        /// Sample rate in Hz
        #[arg(short, long)]
        rate: Option<f64>,

        /// Channels, comma separated
        #[arg(long, value_delimiter = ',')]
        channels: Vec<usize>,

        /// Stream direction (rx, tx)
        #[arg(short, long, default_value = "rx")]
        direction: Direction,

        /// Stream format, defaults to the configured one
        #[arg(short, long)]
        format: Option<StreamFormat>,

        /// Stop after this many seconds (0 = until Ctrl+C)
        #[arg(long, default_value = "0")]
        duration: u64,
    },

    /// Record received samples to a file
    RxToFile {
        /// Device args
        args: Option<String>,

        /// Output file for raw samples
        #[arg(short, long)]
        out: PathBuf,

        /// Number of samples to record
        #[arg(short = 'n', long, default_value = "1000000")]
        samples: usize,

        /// Sample rate in Hz
        #[arg(short, long)]
        rate: Option<f64>,

        /// Stream format, defaults to the configured one
        #[arg(short, long)]
        format: Option<StreamFormat>,
    },

    /// Transmit a continuous tone
    Siggen {
        /// Device args
        args: Option<String>,

        /// Sample rate in Hz
        #[arg(short, long)]
        rate: Option<f64>,

        /// Center frequency in Hz
        #[arg(long)]
        freq: Option<f64>,

        /// Tone amplitude (0.0-1.0)
        #[arg(long, default_value = "0.7")]
        ampl: f32,

        /// Tone offset from center in Hz
        #[arg(long, default_value = "10000")]
        wave_freq: f64,

        /// Stop after this many seconds (0 = until Ctrl+C)
        #[arg(long, default_value = "0")]
        duration: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SdrStreamConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SdrStreamConfig::load().context("Failed to load config")?,
    };
    if let Some(profile) = &cli.profile {
        config = config.with_profile(profile)?;
    }
    if cli.verbose > 0 {
        config.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&config.logging);

    let registry = sdrstream_sim::default_registry();

    match cli.command {
        Commands::Find { args } => cmd_find(&registry, &args),

        Commands::Info { args } => cmd_info(&registry, &config, args),

        Commands::Rate {
            args,
            rate,
            channels,
            direction,
            format,
            duration,
        } => cmd_rate(&registry, &config, args, rate, channels, direction, format, duration),

        Commands::RxToFile {
            args,
            out,
            samples,
            rate,
            format,
        } => cmd_rx_to_file(&registry, &config, args, out, samples, rate, format),

        Commands::Siggen {
            args,
            rate,
            freq,
            ampl,
            wave_freq,
            duration,
        } => cmd_siggen(&registry, &config, args, rate, freq, ampl, wave_freq, duration),
    }
}

/// Install a Ctrl+C handler and return the flag it clears.
fn running_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;
    Ok(running)
}

fn device_args(args: Option<String>, config: &SdrStreamConfig) -> Kwargs {
    match args {
        Some(args) => Kwargs::from(args.as_str()),
        None => config.device.kwargs(),
    }
}

fn open_device(registry: &DriverRegistry, args: &Kwargs) -> Result<Device> {
    let device = registry
        .make(args)
        .with_context(|| format!("Failed to open device '{}'", args))?;
    info!(device = %device, "opened");
    Ok(device)
}

/// Apply the configured frontend settings to `channels`.
fn configure_frontend(
    device: &Device,
    config: &SdrStreamConfig,
    direction: Direction,
    channels: &[usize],
    rate: f64,
    frequency: f64,
) -> Result<()> {
    for &ch in channels {
        device
            .set_sample_rate(direction, ch, rate)
            .with_context(|| format!("Failed to set sample rate {} on {} {}", rate, direction, ch))?;
        device
            .set_frequency(direction, ch, frequency, &Kwargs::new())
            .with_context(|| format!("Failed to tune {} {} to {} Hz", direction, ch, frequency))?;
        device.set_gain(direction, ch, config.device.gain)?;
        if !config.device.antenna.is_empty() {
            device.set_antenna(direction, ch, &config.device.antenna)?;
        }
    }
    Ok(())
}

fn cmd_find(registry: &DriverRegistry, args: &str) -> Result<()> {
    let results = registry.enumerate(&Kwargs::from(args));
    if results.is_empty() {
        println!("No devices found!");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        println!("Found device {}", i);
        for (key, value) in result.iter() {
            println!("  {} = {}", key, value);
        }
        println!();
    }
    Ok(())
}

fn cmd_info(registry: &DriverRegistry, config: &SdrStreamConfig, args: Option<String>) -> Result<()> {
    let device = open_device(registry, &device_args(args, config))?;

    println!("----------------------------------------------------");
    println!("-- Device identification");
    println!("----------------------------------------------------");
    println!("  driver={}", device.driver_key());
    println!("  hardware={}", device.hardware_key());
    for (key, value) in device.hardware_info().iter() {
        println!("  {}={}", key, value);
    }

    println!("----------------------------------------------------");
    println!("-- Peripheral summary");
    println!("----------------------------------------------------");
    println!("  Channels: {} Rx, {} Tx", device.num_channels(Direction::Rx), device.num_channels(Direction::Tx));
    println!("  Timestamps: {}", if device.has_hardware_time("") { "YES" } else { "NO" });
    print_list("Clock sources", &device.list_clock_sources());
    print_list("Time sources", &device.list_time_sources());
    print_list("Sensors", &device.list_sensors());
    print_list("Registers", &device.list_register_interfaces());
    print_list("Settings", &device.setting_info().iter().map(|a| a.key.clone()).collect::<Vec<_>>());
    print_list("GPIOs", &device.list_gpio_banks());
    print_list("UARTs", &device.list_uarts());

    for direction in Direction::BOTH {
        for ch in 0..device.num_channels(direction) {
            print_channel(&device, direction, ch)?;
        }
    }
    Ok(())
}

fn print_list(label: &str, items: &[String]) {
    if !items.is_empty() {
        println!("  {}: {}", label, items.join(", "));
    }
}

fn print_channel(device: &Device, direction: Direction, ch: usize) -> Result<()> {
    println!("----------------------------------------------------");
    println!("-- {} Channel {}", direction, ch);
    println!("----------------------------------------------------");
    println!("  Full-duplex: {}", if device.full_duplex(direction, ch) { "YES" } else { "NO" });

    let formats: Vec<String> = device
        .stream_formats(direction, ch)
        .iter()
        .map(|f| f.to_string())
        .collect();
    let (native, full_scale) = device.native_stream_format(direction, ch);
    println!("  Stream formats: {}", formats.join(", "));
    println!("  Native format: {} [full-scale={}]", native, full_scale);
    for arg in device.stream_args_info(direction, ch) {
        println!("  Stream arg: {} [default={}] {}", arg.key, arg.value, arg.description);
    }

    print_list("Antennas", &device.list_antennas(direction, ch));
    for name in device.list_gains(direction, ch) {
        println!("  {} gain range: {} dB", name, device.gain_element_range(direction, ch, &name));
    }
    println!("  Full gain range: {} dB", device.gain_range(direction, ch));
    for range in device.frequency_range(direction, ch) {
        println!("  Freq range: {} Hz", range);
    }
    for range in device.sample_rate_range(direction, ch) {
        println!("  Sample rates: {} Sps", range);
    }

    // MTU is a stream property, so open one briefly with the native format
    if !device.claims().is_claimed(direction, ch) {
        let mut stream = device.setup_stream(direction, native, &[ch], &Kwargs::new())?;
        println!("  Stream MTU: {} elements", stream.mtu()?);
        stream.close()?;
    }
    Ok(())
}

/// Raw per-channel buffers of `mtu` elements in `format`.
fn raw_buffers(stream: &Stream) -> Result<Vec<Vec<u8>>> {
    let bytes = stream.mtu()? * stream.format().size();
    Ok(vec![vec![0u8; bytes]; stream.channels().len()])
}

/// Log a non-fatal stream status. Returns false when the loop should stop.
fn handle_status(result: &StreamResult, overflows: &mut u64, underflows: &mut u64) -> bool {
    match result.status {
        ErrorCode::None | ErrorCode::Timeout => true,
        ErrorCode::Overflow => {
            *overflows += 1;
            true
        }
        ErrorCode::Underflow => {
            *underflows += 1;
            true
        }
        ErrorCode::TimeError => {
            warn!("late packet");
            true
        }
        ErrorCode::EndOfStream => false,
        other => {
            warn!(status = %other, "stream error");
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_rate(
    registry: &DriverRegistry,
    config: &SdrStreamConfig,
    args: Option<String>,
    rate: Option<f64>,
    channels: Vec<usize>,
    direction: Direction,
    format: Option<StreamFormat>,
    duration: u64,
) -> Result<()> {
    let device = open_device(registry, &device_args(args, config))?;
    let channels = if channels.is_empty() {
        config.stream.channels.clone()
    } else {
        channels
    };
    let rate = rate.unwrap_or(config.device.sample_rate);
    let format = match format {
        Some(format) => format,
        None => config.stream.format()?,
    };
    configure_frontend(&device, config, direction, &channels, rate, config.device.frequency)?;

    let mut stream = device.setup_stream(direction, format, &channels, &config.stream.kwargs())?;
    let mut buffers = raw_buffers(&stream)?;
    let timeout_us = config.stream.timeout_us;
    let running = running_flag()?;

    println!("Stream rate test");
    println!("================");
    println!("Device:     {}", device);
    println!("Direction:  {} {:?}", direction, stream.channels());
    println!("Format:     {} (MTU {})", format, stream.mtu()?);
    println!("Rate:       {:.3} Msps", rate / 1e6);
    println!();
    println!("Streaming... (Press Ctrl+C to stop)\n");

    stream.activate(StreamFlags::NONE, 0, 0)?;
    let start = Instant::now();
    let run_duration = (duration > 0).then(|| Duration::from_secs(duration));
    let mut last_print = Instant::now();
    let mut total: u64 = 0;
    let mut overflows = 0;
    let mut underflows = 0;

    while running.load(Ordering::SeqCst) {
        if run_duration.is_some_and(|d| start.elapsed() >= d) {
            break;
        }

        let result = match direction {
            Direction::Rx => {
                let mut refs: Vec<&mut [u8]> = buffers.iter_mut().map(|b| &mut b[..]).collect();
                stream.read_raw(&mut refs, timeout_us)?
            }
            Direction::Tx => {
                let refs: Vec<&[u8]> = buffers.iter().map(|b| &b[..]).collect();
                let result = stream.write_raw(&refs, StreamFlags::NONE, 0, timeout_us)?;
                let status = stream.read_status(0)?;
                handle_status(&status, &mut overflows, &mut underflows);
                result
            }
        };
        total += result.num_elems as u64;
        if !handle_status(&result, &mut overflows, &mut underflows) {
            break;
        }

        if last_print.elapsed() >= Duration::from_secs(1) {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "{:.3} Msps\tOverflows {}\tUnderflows {}",
                total as f64 / elapsed / 1e6,
                overflows,
                underflows
            );
            last_print = Instant::now();
        }
    }

    stream.deactivate(StreamFlags::NONE, 0)?;
    stream.close()?;

    let elapsed = start.elapsed().as_secs_f64();
    println!();
    println!("Total:      {} samples in {:.2} s", total, elapsed);
    if elapsed > 0.0 {
        println!("Average:    {:.3} Msps", total as f64 / elapsed / 1e6);
    }
    Ok(())
}

fn cmd_rx_to_file(
    registry: &DriverRegistry,
    config: &SdrStreamConfig,
    args: Option<String>,
    out: PathBuf,
    samples: usize,
    rate: Option<f64>,
    format: Option<StreamFormat>,
) -> Result<()> {
    if samples == 0 {
        bail!("Nothing to record: --samples must be positive");
    }
    let device = open_device(registry, &device_args(args, config))?;
    let channels = [config.stream.channels.first().copied().unwrap_or(0)];
    let rate = rate.unwrap_or(config.device.sample_rate);
    let format = match format {
        Some(format) => format,
        None => config.stream.format()?,
    };
    configure_frontend(&device, config, Direction::Rx, &channels, rate, config.device.frequency)?;

    let mut rx = device.setup_stream(Direction::Rx, format, &channels, &config.stream.kwargs())?;
    let mut buffer = raw_buffers(&rx)?.remove(0);
    let size = format.size();
    let file = File::create(&out).with_context(|| format!("Failed to create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    let running = running_flag()?;

    info!(samples, %format, path = %out.display(), "recording");
    // bounded burst: the stream deactivates itself after `samples`
    rx.activate(StreamFlags::NONE, 0, samples)?;

    let mut total = 0usize;
    let mut overflows = 0;
    let mut underflows = 0;
    while rx.state() == StreamState::Active && running.load(Ordering::SeqCst) {
        let result = rx.read_raw(&mut [&mut buffer[..]], config.stream.timeout_us)?;
        if result.num_elems > 0 {
            writer.write_all(&buffer[..result.num_elems * size])?;
            total += result.num_elems;
        }
        if !handle_status(&result, &mut overflows, &mut underflows) {
            warn!(status = %result.status, "recording stopped early");
            break;
        }
    }
    writer.flush()?;
    if rx.state() == StreamState::Active {
        rx.deactivate(StreamFlags::NONE, 0)?;
    }
    rx.close()?;

    println!("Wrote {} samples ({} bytes) to {}", total, total * size, out.display());
    if overflows > 0 {
        println!("Overflows: {}", overflows);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_siggen(
    registry: &DriverRegistry,
    config: &SdrStreamConfig,
    args: Option<String>,
    rate: Option<f64>,
    freq: Option<f64>,
    ampl: f32,
    wave_freq: f64,
    duration: u64,
) -> Result<()> {
    if !(0.0..=1.0).contains(&ampl) {
        bail!("Invalid amplitude: {}. Must be 0.0-1.0", ampl);
    }
    let rate = rate.unwrap_or(config.device.sample_rate);
    if wave_freq.abs() >= rate / 2.0 {
        bail!("Tone offset {} Hz exceeds Nyquist for {} Sps", wave_freq, rate);
    }
    let device = open_device(registry, &device_args(args, config))?;
    let channels = [config.stream.channels.first().copied().unwrap_or(0)];
    configure_frontend(
        &device,
        config,
        Direction::Tx,
        &channels,
        rate,
        freq.unwrap_or(config.device.frequency),
    )?;

    let mut tx = device.setup_stream(Direction::Tx, StreamFormat::CF32, &channels, &config.stream.kwargs())?;
    let step = (TAU as f64 * wave_freq / rate) as f32;
    let mut tone = ToneBuffer::new(tx.mtu()?, ampl, step);
    let running = running_flag()?;

    println!("Signal generator");
    println!("================");
    println!("Device:     {}", device);
    println!("Tone:       {} Hz at amplitude {}", wave_freq, ampl);
    println!("Rate:       {:.3} Msps", rate / 1e6);
    println!();
    println!("Transmitting... (Press Ctrl+C to stop)\n");

    tx.activate(StreamFlags::NONE, 0, 0)?;
    let start = Instant::now();
    let run_duration = (duration > 0).then(|| Duration::from_secs(duration));
    let mut total: u64 = 0;
    let mut overflows = 0;
    let mut underflows = 0;

    loop {
        let stopping = !running.load(Ordering::SeqCst) || run_duration.is_some_and(|d| start.elapsed() >= d);
        let flags = if stopping { StreamFlags::END_BURST } else { StreamFlags::NONE };
        let result = tx.write(&[tone.pending()], flags, 0, config.stream.timeout_us)?;
        tone.consume(result.num_elems);
        total += result.num_elems as u64;
        if !handle_status(&result, &mut overflows, &mut underflows) || stopping {
            break;
        }
        let status = tx.read_status(0)?;
        handle_status(&status, &mut overflows, &mut underflows);
    }

    tx.deactivate(StreamFlags::NONE, 0)?;
    tx.close()?;
    println!("Sent {} samples in {:.2} s, {} underflows", total, start.elapsed().as_secs_f64(), underflows);
    Ok(())
}

/// One MTU of a continuous tone. A new block is only generated once the
/// previous one has been fully sent, so short writes never skip samples.
struct ToneBuffer {
    samples: Vec<Complex<f32>>,
    sent: usize,
    ampl: f32,
    step: f32,
    phase: f32,
}

impl ToneBuffer {
    fn new(len: usize, ampl: f32, step: f32) -> Self {
        let mut tone = Self {
            samples: vec![Complex::new(0.0, 0.0); len],
            sent: 0,
            ampl,
            step,
            phase: 0.0,
        };
        tone.generate();
        tone
    }

    fn generate(&mut self) {
        for sample in self.samples.iter_mut() {
            *sample = Complex::from_polar(self.ampl, self.phase);
            self.phase = (self.phase + self.step) % TAU;
        }
        self.sent = 0;
    }

    /// Samples not yet accepted by the device.
    fn pending(&self) -> &[Complex<f32>] {
        &self.samples[self.sent..]
    }

    fn consume(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.samples.len());
        if self.sent == self.samples.len() {
            self.generate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_tone_buffer_resends_remainder() {
        let step = 0.25f32;
        let mut tone = ToneBuffer::new(8, 1.0, step);
        assert_eq!(tone.pending().len(), 8);
        let third = tone.pending()[3];

        tone.consume(3);
        assert_eq!(tone.pending().len(), 5);
        assert_eq!(tone.pending()[0], third);

        tone.consume(0);
        assert_eq!(tone.pending()[0], third);

        // finishing the block continues the phase into the next one
        tone.consume(5);
        assert_eq!(tone.pending().len(), 8);
        let expect = Complex::from_polar(1.0f32, 8.0 * step);
        assert!((tone.pending()[0] - expect).norm() < 1e-5);
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_rate_args() {
        let cli = Cli::parse_from([
            "sdrstream", "-vv", "rate", "driver=loopback", "--channels", "0,1", "-d", "tx", "-f", "CS16",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Rate {
                args,
                channels,
                direction,
                format,
                ..
            } => {
                assert_eq!(args.as_deref(), Some("driver=loopback"));
                assert_eq!(channels, vec![0, 1]);
                assert_eq!(direction, Direction::Tx);
                assert_eq!(format, Some(StreamFormat::CS16));
            }
            _ => panic!("expected rate"),
        }
    }

    #[test]
    fn test_device_args_fall_back_to_config() {
        let mut config = SdrStreamConfig::default();
        config.device.args = "driver=null".to_string();
        assert_eq!(device_args(None, &config), Kwargs::from("driver=null"));
        assert_eq!(
            device_args(Some("driver=loopback".to_string()), &config),
            Kwargs::from("driver=loopback")
        );
    }

    #[test]
    fn test_status_handling() {
        let (mut o, mut u) = (0, 0);
        assert!(handle_status(&StreamResult::ok(10), &mut o, &mut u));
        assert!(handle_status(&StreamResult::status(ErrorCode::Overflow), &mut o, &mut u));
        assert_eq!(o, 1);
        assert!(!handle_status(&StreamResult::status(ErrorCode::EndOfStream), &mut o, &mut u));
        assert!(!handle_status(&StreamResult::status(ErrorCode::NotSupported), &mut o, &mut u));
    }
}
