//! Driver registry and device factory.
//!
//! Drivers register a [`DeviceDriver`] that can discover devices and open
//! them. [`DriverRegistry::make`] resolves construction args to a single
//! driver and caches the opened device, so a second `make` for the same
//! device returns the existing instance while any handle to it is alive.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, Weak};

use crate::device::{Device, DeviceInner, SdrDevice};
use crate::error::{SdrError, SdrResult};
use crate::kwargs::Kwargs;

/// Name of the placeholder driver that is only selected when named.
pub const NULL_DRIVER: &str = "null";

/// A driver that can find and open devices.
pub trait DeviceDriver: Send + Sync {
    /// Driver key, matched against the `driver` arg.
    fn name(&self) -> &str;

    /// Discover devices matching `args`. Each result identifies one device.
    fn find(&self, args: &Kwargs) -> Vec<Kwargs>;

    /// Open a device. `args` is the merge of a discovery result and the
    /// caller's args.
    fn make(&self, args: &Kwargs) -> SdrResult<Box<dyn SdrDevice>>;
}

/// Registry of drivers with a table of opened devices.
pub struct DriverRegistry {
    drivers: Vec<Box<dyn DeviceDriver>>,
    table: Mutex<HashMap<Kwargs, Weak<DeviceInner>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, driver: Box<dyn DeviceDriver>) {
        tracing::debug!(driver = driver.name(), "registered driver");
        self.drivers.push(driver);
    }

    pub fn get(&self, name: &str) -> Option<&dyn DeviceDriver> {
        self.drivers
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Discover devices across drivers.
    ///
    /// A `driver` arg restricts the search to that driver. Every result is
    /// tagged with the `driver` that found it.
    pub fn enumerate(&self, args: &Kwargs) -> Vec<Kwargs> {
        let wanted = args.get("driver");
        let mut results = Vec::new();
        for driver in &self.drivers {
            if wanted.is_some_and(|w| w != driver.name()) {
                continue;
            }
            let found = driver.find(args);
            tracing::debug!(driver = driver.name(), count = found.len(), "enumerated");
            results.extend(found.into_iter().map(|mut r| {
                r.insert("driver", driver.name());
                r
            }));
        }
        results
    }

    /// Open the device described by `args`.
    ///
    /// The first discovery result is merged with `args` (caller keys fill
    /// gaps only) and handed to the matching driver. Without a `driver` key
    /// the null driver is never chosen, and if more than one real driver is
    /// registered the call fails instead of guessing.
    pub fn make(&self, args: &Kwargs) -> SdrResult<Device> {
        if let Some(device) = self.lookup(args) {
            return Ok(device);
        }

        let discovered = self.enumerate(args).into_iter().next().unwrap_or_default();
        if let Some(device) = self.lookup(&discovered) {
            return Ok(device);
        }

        let mut hybrid = discovered.clone();
        hybrid.merge_missing(args);

        let wanted = hybrid.get("driver");
        if wanted.is_none() && self.drivers.iter().filter(|d| d.name() != NULL_DRIVER).count() > 1 {
            return Err(SdrError::NotFound(
                "no driver specified and no enumeration results".to_string(),
            ));
        }
        let driver = self
            .drivers
            .iter()
            .find(|d| match wanted {
                Some(w) => d.name() == w,
                None => d.name() != NULL_DRIVER,
            })
            .ok_or_else(|| SdrError::NotFound(format!("no driver matches '{}'", hybrid)))?;

        let device = Device::from_boxed(driver.make(&hybrid)?);
        let key = if discovered.is_empty() { hybrid } else { discovered };

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.retain(|_, weak| weak.strong_count() > 0);
        // another thread may have opened the same device meanwhile
        if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
            return Ok(Device::from_inner(existing));
        }
        tracing::info!(device = %device, args = %key, "opened device");
        table.insert(key, device.downgrade());
        Ok(device)
    }

    /// Open several devices in parallel. Results keep the input order.
    pub fn make_many(&self, args_list: &[Kwargs]) -> Vec<SdrResult<Device>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = args_list
                .iter()
                .map(|args| scope.spawn(move || self.make(args)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(SdrError::InvalidArgument("driver panicked while opening device".to_string()))
                    })
                })
                .collect()
        })
    }

    /// Number of opened devices still alive.
    pub fn open_devices(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn lookup(&self, args: &Kwargs) -> Option<Device> {
        if args.is_empty() {
            return None;
        }
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.get(args).and_then(Weak::upgrade).map(Device::from_inner)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::MockDevice;

    struct MockDriver {
        name: &'static str,
        serials: Vec<&'static str>,
    }

    impl DeviceDriver for MockDriver {
        fn name(&self) -> &str {
            self.name
        }

        fn find(&self, args: &Kwargs) -> Vec<Kwargs> {
            if self.name == NULL_DRIVER && args.get("type") != Some("null") {
                return Vec::new();
            }
            self.serials
                .iter()
                .filter(|s| args.get("serial").map_or(true, |want| want == **s))
                .map(|s| Kwargs::from([("serial", *s)]))
                .collect()
        }

        fn make(&self, _args: &Kwargs) -> SdrResult<Box<dyn SdrDevice>> {
            Ok(Box::new(MockDevice::default()))
        }
    }

    fn registry() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register(Box::new(MockDriver {
            name: NULL_DRIVER,
            serials: vec!["0"],
        }));
        registry.register(Box::new(MockDriver {
            name: "alpha",
            serials: vec!["a1", "a2"],
        }));
        registry.register(Box::new(MockDriver {
            name: "beta",
            serials: vec!["b1"],
        }));
        registry
    }

    #[test]
    fn test_list_and_get() {
        let registry = registry();
        assert_eq!(registry.list(), vec!["null", "alpha", "beta"]);
        assert!(registry.get("beta").is_some());
        assert!(registry.get("gamma").is_none());
    }

    #[test]
    fn test_enumerate_tags_driver() {
        let registry = registry();
        let all = registry.enumerate(&Kwargs::new());
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|r| r.contains_key("driver")));

        let beta = registry.enumerate(&Kwargs::from("driver=beta"));
        assert_eq!(beta, vec![Kwargs::from("driver=beta, serial=b1")]);

        let null = registry.enumerate(&Kwargs::from("type=null"));
        assert!(null.iter().any(|r| r.get("driver") == Some("null")));
    }

    #[test]
    fn test_make_caches_live_devices() {
        let registry = registry();
        let args = Kwargs::from("serial=a2");
        let first = registry.make(&args).unwrap();
        let second = registry.make(&args).unwrap();
        assert!(first.same_device(&second));
        assert_eq!(registry.open_devices(), 1);

        drop(first);
        drop(second);
        assert_eq!(registry.open_devices(), 0);
        let third = registry.make(&args).unwrap();
        assert_eq!(registry.open_devices(), 1);
        drop(third);
    }

    #[test]
    fn test_make_without_match() {
        let registry = registry();
        let err = registry.make(&Kwargs::from("serial=zzz")).unwrap_err();
        assert!(matches!(err, SdrError::NotFound(_)));

        let err = registry.make(&Kwargs::from("driver=gamma")).unwrap_err();
        assert!(matches!(err, SdrError::NotFound(_)));
    }

    #[test]
    fn test_null_only_when_named() {
        let mut registry = DriverRegistry::new();
        registry.register(Box::new(MockDriver {
            name: NULL_DRIVER,
            serials: vec!["0"],
        }));
        registry.register(Box::new(MockDriver {
            name: "alpha",
            serials: vec![],
        }));
        // nothing found, single real driver: it gets the args
        assert!(registry.make(&Kwargs::new()).is_ok());

        let null = registry.make(&Kwargs::from("driver=null")).unwrap();
        assert_eq!(null.driver_key(), "mock");
    }

    #[test]
    fn test_make_many_keeps_order() {
        let registry = registry();
        let results = registry.make_many(&[
            Kwargs::from("serial=a1"),
            Kwargs::from("serial=nope"),
            Kwargs::from("serial=b1"),
        ]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
