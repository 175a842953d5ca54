//! Key/value argument maps and their `key=value, key=value` markup.
//!
//! Used for device construction args, stream args and enumeration results.
//! Ordered so two maps with the same entries compare and hash equal
//! regardless of insertion order.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// String to string argument map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(BTreeMap<String, String>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse the value of `key`, `None` when absent or unparseable.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Copy entries from `other` whose keys are not already present.
    pub fn merge_missing(&mut self, other: &Kwargs) {
        for (k, v) in other.iter() {
            self.0.entry(k.to_string()).or_insert_with(|| v.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Parses `key=value` pairs separated by commas.
///
/// Keys and values are trimmed, empty entries are skipped and a bare key
/// gets an empty value. Never fails.
impl FromStr for Kwargs {
    type Err = Infallible;

    fn from_str(markup: &str) -> Result<Self, Self::Err> {
        let mut kwargs = Kwargs::new();
        for pair in markup.split(',') {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (pair.trim(), ""),
            };
            if key.is_empty() {
                continue;
            }
            kwargs.insert(key, value);
        }
        Ok(kwargs)
    }
}

impl std::fmt::Display for Kwargs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

impl From<&str> for Kwargs {
    fn from(markup: &str) -> Self {
        match markup.parse() {
            Ok(kwargs) => kwargs,
            Err(never) => match never {},
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Kwargs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Kwargs(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Kwargs {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl IntoIterator for Kwargs {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markup_roundtrip() {
        let args = Kwargs::from([("bufflen", "8192"), ("buffers", "15")]);
        let markup = args.to_string();
        assert_eq!(markup, "bufflen=8192, buffers=15");
        assert_eq!(Kwargs::from(markup.as_str()), args);
    }

    #[test]
    fn test_parse_whitespace_and_bare_keys() {
        let args: Kwargs = " driver = null , type=null,, Baz ,".parse().unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args.get("driver"), Some("null"));
        assert_eq!(args.get("type"), Some("null"));
        assert_eq!(args.get("Baz"), Some(""));
    }

    #[test]
    fn test_order_insignificant() {
        let a = Kwargs::from("a=1,b=2");
        let b = Kwargs::from("b=2, a=1");
        assert_eq!(a, b);
        assert!(Kwargs::from("").is_empty());
    }

    #[test]
    fn test_merge_missing() {
        let mut found = Kwargs::from("driver=loopback,label=Loopback");
        found.merge_missing(&Kwargs::from("driver=other,serial=42"));
        assert_eq!(found.get("driver"), Some("loopback"));
        assert_eq!(found.get("serial"), Some("42"));
        assert_eq!(found.get_parsed::<u32>("serial"), Some(42));
        assert_eq!(found.get_parsed::<u32>("label"), None);
    }
}
