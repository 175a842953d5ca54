//! Common value types shared by devices and streams.

use serde::{Deserialize, Serialize};

/// Stream direction.
///
/// Integer values follow the conventional driver ABI (TX = 0, RX = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Transmit stream
    Tx = 0,
    /// Receive stream
    Rx = 1,
}

impl Direction {
    /// Both directions, transmit first.
    pub const BOTH: [Direction; 2] = [Direction::Tx, Direction::Rx];
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = crate::SdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tx" => Ok(Direction::Tx),
            "rx" => Ok(Direction::Rx),
            other => Err(crate::SdrError::InvalidArgument(format!(
                "direction not in RX/TX: {}",
                other
            ))),
        }
    }
}

/// Bounds of a tunable parameter.
///
/// A step of zero means the range is continuous.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Range {
    minimum: f64,
    maximum: f64,
    step: f64,
}

impl Range {
    /// Create a continuous range.
    pub fn new(minimum: f64, maximum: f64) -> Self {
        Self::with_step(minimum, maximum, 0.0)
    }

    /// Create a stepped range.
    pub fn with_step(minimum: f64, maximum: f64, step: f64) -> Self {
        Self {
            minimum,
            maximum,
            step,
        }
    }

    /// Lower bound.
    #[inline]
    pub fn minimum(&self) -> f64 {
        self.minimum
    }

    /// Upper bound.
    #[inline]
    pub fn maximum(&self) -> f64 {
        self.maximum
    }

    /// Resolution, zero when continuous.
    #[inline]
    pub fn step(&self) -> f64 {
        self.step
    }

    /// True when the range has no step.
    #[inline]
    pub fn is_continuous(&self) -> bool {
        self.step == 0.0
    }

    /// True if `value` lies within the bounds (inclusive).
    pub fn contains(&self, value: f64) -> bool {
        value >= self.minimum && value <= self.maximum
    }

    /// Clamp `value` into the range, snapping to the step grid when stepped.
    pub fn clip(&self, value: f64) -> f64 {
        let mut v = value.clamp(self.minimum, self.maximum);
        if self.step > 0.0 {
            let steps = ((v - self.minimum) / self.step).round();
            v = (self.minimum + steps * self.step).min(self.maximum);
        }
        v
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_continuous() {
            write!(f, "[{}, {}]", self.minimum, self.maximum)
        } else {
            write!(f, "[{}, {}, {}]", self.minimum, self.maximum, self.step)
        }
    }
}

/// Value type of a configurable argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    Bool,
    Int,
    Float,
    #[default]
    String,
}

/// Description of one configurable argument or setting.
///
/// Produced by drivers for UI and validation; never interpreted by the core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgInfo {
    /// Key used with the settings API or in stream args
    pub key: String,
    /// Default value as a string
    pub value: String,
    /// Display name
    pub name: String,
    /// Longer description
    pub description: String,
    /// Units of the value, if any
    pub units: String,
    /// Value type
    pub arg_type: ArgType,
    /// Allowed range for numeric types
    pub range: Range,
    /// Allowed values when choice-constrained
    pub options: Vec<String>,
    /// Display names for `options`, same length when present
    pub option_names: Vec<String>,
}

impl ArgInfo {
    /// Create a descriptor with a key, type and default value.
    pub fn new(key: impl Into<String>, arg_type: ArgType, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            arg_type,
            ..Default::default()
        }
    }

    /// Set the display name and description.
    pub fn describe(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    /// Set the units.
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Set the allowed range.
    pub fn range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    /// Constrain to a set of `(value, name)` choices.
    pub fn options<I, V, N>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = (V, N)>,
        V: Into<String>,
        N: Into<String>,
    {
        let (options, names): (Vec<String>, Vec<String>) = choices
            .into_iter()
            .map(|(v, n)| (v.into(), n.into()))
            .unzip();
        self.options = options;
        self.option_names = names;
        self
    }

    /// Iterate over `(value, name)` choice pairs.
    pub fn choices(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options
            .iter()
            .zip(self.option_names.iter())
            .map(|(v, n)| (v.as_str(), n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_defaults() {
        let range = Range::default();
        assert_eq!(range.minimum(), 0.0);
        assert_eq!(range.maximum(), 0.0);
        assert_eq!(range.step(), 0.0);
        assert!(range.is_continuous());
    }

    #[test]
    fn test_range_step() {
        let range = Range::with_step(1.0, 2.0, 0.05);
        assert_eq!(range.minimum(), 1.0);
        assert_eq!(range.maximum(), 2.0);
        assert_eq!(range.step(), 0.05);
        assert!(!range.is_continuous());
        assert!(range.contains(1.5));
        assert!(!range.contains(2.5));
    }

    #[test]
    fn test_range_clip() {
        let range = Range::with_step(0.0, 10.0, 2.0);
        assert_eq!(range.clip(3.1), 4.0);
        assert_eq!(range.clip(-5.0), 0.0);
        assert_eq!(range.clip(11.0), 10.0);
        assert_eq!(Range::new(0.0, 1.0).clip(0.25), 0.25);
    }

    #[test]
    fn test_arg_info_fields() {
        let info = ArgInfo::new("TestKey", ArgType::Bool, "false")
            .describe("TestName", "TestDescription")
            .units("TestUnits")
            .range(Range::with_step(0.0, 1.0, 0.1))
            .options([("opt1", "Option1"), ("opt2", "Option2"), ("opt3", "Option3")]);

        assert_eq!(info.key, "TestKey");
        assert_eq!(info.name, "TestName");
        assert_eq!(info.description, "TestDescription");
        assert_eq!(info.units, "TestUnits");
        assert_eq!(info.arg_type, ArgType::Bool);
        assert_eq!(info.range.step(), 0.1);
        assert_eq!(info.options, vec!["opt1", "opt2", "opt3"]);
        assert_eq!(info.option_names, vec!["Option1", "Option2", "Option3"]);
        assert_eq!(info.choices().nth(1), Some(("opt2", "Option2")));
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("RX".parse::<Direction>().unwrap(), Direction::Rx);
        assert_eq!(" tx ".parse::<Direction>().unwrap(), Direction::Tx);
        assert!("both".parse::<Direction>().is_err());
        assert_eq!(Direction::Rx as i32, 1);
    }
}
