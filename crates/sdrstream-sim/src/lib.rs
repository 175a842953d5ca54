//! # Software Drivers
//!
//! Drivers that need no hardware:
//!
//! - [`NullDriver`] (`driver=null`): accepts everything, transfers nothing
//! - [`LoopbackDriver`] (`driver=loopback`): Tx samples come back on Rx
//!
//! [`default_registry`] returns a registry with both installed.
//!
//! ```rust,ignore
//! use sdrstream_core::prelude::*;
//!
//! let registry = sdrstream_sim::default_registry();
//! for found in registry.enumerate(&Kwargs::new()) {
//!     println!("{}", found);
//! }
//! let device = registry.make(&"driver=loopback".into())?;
//! ```

pub mod loopback;
pub mod null;
pub mod settings;

pub use loopback::{LoopbackDevice, LoopbackDriver, LOOPBACK_DRIVER};
pub use null::{NullDevice, NullDriver};
pub use settings::SettingsStore;

use sdrstream_core::DriverRegistry;

/// Registry with the null and loopback drivers.
pub fn default_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(Box::new(NullDriver::new()));
    registry.register(Box::new(LoopbackDriver::new()));
    registry
}
