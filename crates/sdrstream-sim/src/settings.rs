//! Keyed last-write-wins store backing the software drivers' frontend,
//! settings, register and bus emulation.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use sdrstream_core::Direction;

#[derive(Debug, Default)]
pub struct SettingsStore {
    values: RwLock<HashMap<String, String>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for a per-channel value, e.g. `rx:0:gain:LNA`.
    pub fn channel_key(direction: Direction, channel: usize, name: &str) -> String {
        format!("{}:{}:{}", direction.to_string().to_lowercase(), channel, name)
    }

    pub fn set(&self, key: impl Into<String>, value: impl ToString) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let store = SettingsStore::new();
        store.set("mode", "a");
        store.set("mode", "b");
        assert_eq!(store.get("mode").as_deref(), Some("b"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_typed_access() {
        let store = SettingsStore::new();
        let key = SettingsStore::channel_key(Direction::Rx, 1, "gain");
        assert_eq!(key, "rx:1:gain");
        assert_eq!(store.get_or(&key, 3.0), 3.0);
        store.set(key.clone(), 12.5);
        assert_eq!(store.get_or(&key, 0.0), 12.5);
        store.set("flag", true);
        assert!(store.get_or("flag", false));
    }

    #[test]
    fn test_prefix_listing() {
        let store = SettingsStore::new();
        store.set("reg:FPGA:16", 1);
        store.set("reg:FPGA:4", 2);
        store.set("gpio:MAIN", 3);
        assert_eq!(store.keys_with_prefix("reg:"), vec!["reg:FPGA:16", "reg:FPGA:4"]);
    }
}
