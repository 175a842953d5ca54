//! # SDR Streaming Core
//!
//! Device-agnostic streaming data plane for software-defined radios: moving
//! sample buffers between an application and RF hardware, with stream
//! lifecycle, timed activation, flow status reporting and tick/time
//! conversion.
//!
//! Drivers implement [`SdrDevice`] and register a [`DeviceDriver`] with a
//! [`DriverRegistry`]. Applications open a [`Device`], set up a [`Stream`]
//! and exchange buffers.
//!
//! ## Stream Flow
//!
//! ```text
//! make(args) → Device → setup_stream(dir, format, channels, args) → Configured
//!   → activate → Active → read/write/read_status … → deactivate → Inactive
//!   → close → Closed
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sdrstream_core::prelude::*;
//!
//! let device = registry.make(&"driver=loopback".into())?;
//! let mut rx = device.setup_stream(Direction::Rx, StreamFormat::CF32, &[0], &Kwargs::new())?;
//! rx.activate(StreamFlags::NONE, 0, 0)?;
//!
//! let mut buf = vec![Complex::new(0.0f32, 0.0); rx.mtu()?];
//! let result = rx.read(&mut [&mut buf[..]], 100_000)?;
//! if result.status == ErrorCode::Timeout {
//!     // nothing arrived yet
//! }
//! rx.close()?;
//! ```

pub mod buffer;
pub mod config;
pub mod convert;
pub mod device;
pub mod direct;
pub mod error;
pub mod flags;
pub mod format;
pub mod kwargs;
pub mod logger;
pub mod observe;
pub mod registry;
pub mod stream;
pub mod time;
pub mod types;

pub use config::{ConfigError, SdrStreamConfig};
pub use convert::{converters, ConverterFn, ConverterPriority, ConverterRegistry};
pub use device::{ChannelClaims, Device, SdrDevice, StreamHandle, StreamResult, DEFAULT_MTU};
pub use direct::{DirectBuffer, ReadBuffer, WriteBuffer};
pub use error::{BufferError, ErrorCode, SdrError, SdrResult};
pub use flags::StreamFlags;
pub use format::{format_to_size, StreamFormat, StreamSample};
pub use kwargs::Kwargs;
pub use registry::{DeviceDriver, DriverRegistry};
pub use stream::{Stream, StreamDescriptor, StreamState};
pub use time::{ticks_to_time_ns, time_ns_to_ticks};
pub use types::{ArgInfo, ArgType, Direction, Range};

pub use num_complex::Complex;

/// Common imports for applications.
pub mod prelude {
    pub use crate::device::{Device, StreamResult};
    pub use crate::error::{ErrorCode, SdrError, SdrResult};
    pub use crate::flags::StreamFlags;
    pub use crate::format::StreamFormat;
    pub use crate::kwargs::Kwargs;
    pub use crate::registry::DriverRegistry;
    pub use crate::stream::Stream;
    pub use crate::types::Direction;
    pub use num_complex::Complex;
}
