//! # Format Converters
//!
//! Element converters between stream formats, looked up by source format,
//! target format and priority. Several converters may serve the same pair;
//! [`ConverterRegistry::function`] picks the one with the highest priority.
//!
//! ```text
//! src bytes ──ConverterFn(src, dst, num_elems, scalar)──► dst bytes
//! ```
//!
//! ## Sample Mapping
//!
//! | From → To | Rule |
//! |-----------|------|
//! | float → Sn | `trunc(v * (2^(n-1) - 1))` |
//! | Sn → float | `v / (2^(n-1) - 1)` |
//! | Un ↔ Sn | offset by `2^(n-1)`, wrapping |
//! | Sn ↔ Sm | arithmetic shift by the width difference |
//! | F64 ↔ F32 | cast |
//!
//! Unsigned ↔ float and unsigned ↔ other widths chain the rules above. After
//! conversion each value is multiplied by `scalar`; a copy converter with a
//! scalar of 1 is a plain byte copy.
//!
//! [`converters`] holds the process-wide registry seeded with
//! [`ConverterRegistry::with_defaults`].

use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;
use std::sync::{OnceLock, RwLock};

use bytemuck::Pod;

use crate::error::{SdrError, SdrResult};
use crate::format::StreamFormat;

/// Converts `num_elems` elements from `src` into `dst`, scaling each value
/// by the last argument.
pub type ConverterFn = fn(&[u8], &mut [u8], usize, f64);

/// Preference among converters for the same format pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConverterPriority {
    /// Portable scalar loops
    Generic = 0,
    /// SIMD or otherwise optimized
    Vectorized = 3,
    /// Application supplied
    Custom = 5,
}

type TargetTable = BTreeMap<StreamFormat, BTreeMap<ConverterPriority, ConverterFn>>;

/// Table of converters keyed by (source, target, priority).
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    table: BTreeMap<StreamFormat, TargetTable>,
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<(StreamFormat, StreamFormat)> = self
            .table
            .iter()
            .flat_map(|(&src, targets)| targets.keys().map(move |&dst| (src, dst)))
            .collect();
        f.debug_struct("ConverterRegistry").field("pairs", &pairs).finish()
    }
}

impl ConverterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the generic converters between the float, signed
    /// and unsigned formats of 8, 16 and 32 bits, real and complex, plus
    /// F64 ↔ F32.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (source, target, function) in default_converters() {
            // fresh table, pairs are unique
            let _ = registry.register(source, target, ConverterPriority::Generic, function);
        }
        registry
    }

    /// Add a converter. An existing entry for the same key is kept and the
    /// registration refused.
    pub fn register(
        &mut self,
        source: StreamFormat,
        target: StreamFormat,
        priority: ConverterPriority,
        function: ConverterFn,
    ) -> SdrResult<()> {
        let slot = self
            .table
            .entry(source)
            .or_default()
            .entry(target)
            .or_default();
        if slot.contains_key(&priority) {
            tracing::error!(%source, %target, ?priority, "converter already registered");
            return Err(SdrError::InvalidArgument(format!(
                "converter {} -> {} at {:?} priority already registered",
                source, target, priority
            )));
        }
        slot.insert(priority, function);
        tracing::trace!(%source, %target, ?priority, "registered converter");
        Ok(())
    }

    /// Formats `source` converts to, sorted by name.
    pub fn list_target_formats(&self, source: StreamFormat) -> Vec<StreamFormat> {
        let targets = self.table.get(&source).map(|t| t.keys().copied().collect());
        sorted_by_name(targets.unwrap_or_default())
    }

    /// Formats that convert to `target`, sorted by name.
    pub fn list_source_formats(&self, target: StreamFormat) -> Vec<StreamFormat> {
        let sources = self
            .table
            .iter()
            .filter(|(_, targets)| targets.contains_key(&target))
            .map(|(&source, _)| source)
            .collect();
        sorted_by_name(sources)
    }

    /// Priorities registered for a pair, lowest first.
    pub fn list_priorities(&self, source: StreamFormat, target: StreamFormat) -> Vec<ConverterPriority> {
        self.priorities(source, target)
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every format with at least one converter, sorted by name.
    pub fn list_available_source_formats(&self) -> Vec<StreamFormat> {
        let sources = self
            .table
            .iter()
            .filter(|(_, targets)| !targets.is_empty())
            .map(|(&source, _)| source)
            .collect();
        sorted_by_name(sources)
    }

    /// Highest priority converter for a pair.
    pub fn function(&self, source: StreamFormat, target: StreamFormat) -> SdrResult<ConverterFn> {
        self.priorities(source, target)
            .and_then(|p| p.values().next_back().copied())
            .ok_or_else(|| SdrError::NotFound(format!("no converter {} -> {}", source, target)))
    }

    /// Converter registered for a pair at exactly `priority`.
    pub fn function_with_priority(
        &self,
        source: StreamFormat,
        target: StreamFormat,
        priority: ConverterPriority,
    ) -> SdrResult<ConverterFn> {
        self.priorities(source, target)
            .and_then(|p| p.get(&priority).copied())
            .ok_or_else(|| {
                SdrError::NotFound(format!(
                    "no converter {} -> {} at {:?} priority",
                    source, target, priority
                ))
            })
    }

    /// Convert `num_elems` elements with the best converter for the pair,
    /// after checking both buffers are large enough.
    pub fn convert(
        &self,
        source: StreamFormat,
        target: StreamFormat,
        src: &[u8],
        dst: &mut [u8],
        num_elems: usize,
        scalar: f64,
    ) -> SdrResult<()> {
        let function = self.function(source, target)?;
        let need = (num_elems * source.size(), num_elems * target.size());
        if src.len() < need.0 || dst.len() < need.1 {
            return Err(SdrError::InvalidArgument(format!(
                "{} elements need {} source and {} target bytes, got {} and {}",
                num_elems,
                need.0,
                need.1,
                src.len(),
                dst.len()
            )));
        }
        function(src, dst, num_elems, scalar);
        Ok(())
    }

    fn priorities(
        &self,
        source: StreamFormat,
        target: StreamFormat,
    ) -> Option<&BTreeMap<ConverterPriority, ConverterFn>> {
        self.table.get(&source).and_then(|t| t.get(&target))
    }
}

fn sorted_by_name(mut formats: Vec<StreamFormat>) -> Vec<StreamFormat> {
    formats.sort_by_key(|f| f.as_str());
    formats
}

/// Process-wide registry, seeded with the default converters on first use.
pub fn converters() -> &'static RwLock<ConverterRegistry> {
    static REGISTRY: OnceLock<RwLock<ConverterRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(ConverterRegistry::with_defaults()))
}

// ---------------------------------------------------------------------------
// Sample primitives
// ---------------------------------------------------------------------------

/// One component value of a stream format.
trait Primitive: Pod {
    const FLOAT: bool;

    /// Value as a float, integers divided by their full scale.
    fn to_float(self) -> f32;
    fn from_float(v: f32) -> Self;

    /// Integer value aligned to the top bits of an `i32`.
    fn to_wide(self) -> i32;
    fn from_wide(v: i32) -> Self;

    fn to_f64(self) -> f64;
    /// Saturating for integers.
    fn from_f64(v: f64) -> Self;
}

macro_rules! float_primitive {
    ($t:ty) => {
        impl Primitive for $t {
            const FLOAT: bool = true;

            fn to_float(self) -> f32 {
                self as f32
            }

            fn from_float(v: f32) -> Self {
                v as $t
            }

            fn to_wide(self) -> i32 {
                i32::from_float(self.to_float())
            }

            fn from_wide(v: i32) -> Self {
                Self::from_float(v.to_float())
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

macro_rules! signed_primitive {
    ($t:ty, $shift:expr) => {
        impl Primitive for $t {
            const FLOAT: bool = false;

            fn to_float(self) -> f32 {
                self as f32 / <$t>::MAX as f32
            }

            fn from_float(v: f32) -> Self {
                (v * <$t>::MAX as f32) as $t
            }

            fn to_wide(self) -> i32 {
                (self as i32) << $shift
            }

            fn from_wide(v: i32) -> Self {
                (v >> $shift) as $t
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

macro_rules! unsigned_primitive {
    ($t:ty, $signed:ty) => {
        impl Primitive for $t {
            const FLOAT: bool = false;

            fn to_float(self) -> f32 {
                offset_to_signed!(self, $t, $signed).to_float()
            }

            fn from_float(v: f32) -> Self {
                signed_to_offset!(<$signed>::from_float(v), $t)
            }

            fn to_wide(self) -> i32 {
                offset_to_signed!(self, $t, $signed).to_wide()
            }

            fn from_wide(v: i32) -> Self {
                signed_to_offset!(<$signed>::from_wide(v), $t)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

// Offset binary and two's complement differ only in the top bit.
macro_rules! offset_to_signed {
    ($v:expr, $t:ty, $signed:ty) => {
        ($v ^ (<$t>::MAX / 2 + 1)) as $signed
    };
}

macro_rules! signed_to_offset {
    ($v:expr, $t:ty) => {
        ($v as $t) ^ (<$t>::MAX / 2 + 1)
    };
}

float_primitive!(f32);
float_primitive!(f64);
signed_primitive!(i32, 0);
signed_primitive!(i16, 16);
signed_primitive!(i8, 24);
unsigned_primitive!(u32, i32);
unsigned_primitive!(u16, i16);
unsigned_primitive!(u8, i8);

fn convert_sample<S: Primitive, D: Primitive>(v: S) -> D {
    if S::FLOAT || D::FLOAT {
        D::from_float(v.to_float())
    } else {
        D::from_wide(v.to_wide())
    }
}

/// Generic converter between component types. `DEPTH` is the number of
/// components per element: 1 for real formats, 2 for complex.
fn convert_elements<S: Primitive, D: Primitive, const DEPTH: usize>(
    src: &[u8],
    dst: &mut [u8],
    num_elems: usize,
    scalar: f64,
) {
    let count = num_elems * DEPTH;
    let pairs = src
        .chunks_exact(size_of::<S>())
        .zip(dst.chunks_exact_mut(size_of::<D>()))
        .take(count);
    for (s, d) in pairs {
        let mut v: D = convert_sample(bytemuck::pod_read_unaligned::<S>(s));
        if scalar != 1.0 {
            v = D::from_f64(v.to_f64() * scalar);
        }
        d.copy_from_slice(bytemuck::bytes_of(&v));
    }
}

fn copy_elements<T: Primitive, const DEPTH: usize>(src: &[u8], dst: &mut [u8], num_elems: usize, scalar: f64) {
    if scalar != 1.0 {
        return convert_elements::<T, T, DEPTH>(src, dst, num_elems, scalar);
    }
    let len = (num_elems * DEPTH * size_of::<T>()).min(src.len()).min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
}

macro_rules! converter_table {
    ($depth:literal; $($src:ident : $s:ty => $dst:ident : $d:ty),* $(,)?) => {
        [
            $(
                (
                    StreamFormat::$src,
                    StreamFormat::$dst,
                    convert_elements::<$s, $d, $depth> as ConverterFn,
                ),
            )*
        ]
    };
}

fn default_converters() -> Vec<(StreamFormat, StreamFormat, ConverterFn)> {
    let mut table = vec![
        (StreamFormat::F32, StreamFormat::F32, copy_elements::<f32, 1> as ConverterFn),
        (StreamFormat::S32, StreamFormat::S32, copy_elements::<i32, 1> as ConverterFn),
        (StreamFormat::S16, StreamFormat::S16, copy_elements::<i16, 1> as ConverterFn),
        (StreamFormat::S8, StreamFormat::S8, copy_elements::<i8, 1> as ConverterFn),
        (StreamFormat::CF32, StreamFormat::CF32, copy_elements::<f32, 2> as ConverterFn),
        (StreamFormat::CS32, StreamFormat::CS32, copy_elements::<i32, 2> as ConverterFn),
        (StreamFormat::CS16, StreamFormat::CS16, copy_elements::<i16, 2> as ConverterFn),
        (StreamFormat::CS8, StreamFormat::CS8, copy_elements::<i8, 2> as ConverterFn),
    ];
    table.extend(converter_table![1;
        F64: f64 => F32: f32, F32: f32 => F64: f64,
        F32: f32 => S32: i32, S32: i32 => F32: f32,
        F32: f32 => S16: i16, S16: i16 => F32: f32,
        F32: f32 => S8: i8, S8: i8 => F32: f32,
        F32: f32 => U32: u32, U32: u32 => F32: f32,
        F32: f32 => U16: u16, U16: u16 => F32: f32,
        F32: f32 => U8: u8, U8: u8 => F32: f32,
        S32: i32 => S16: i16, S16: i16 => S32: i32,
        S32: i32 => S8: i8, S8: i8 => S32: i32,
        S16: i16 => S8: i8, S8: i8 => S16: i16,
        U32: u32 => S32: i32, S32: i32 => U32: u32,
        U32: u32 => S16: i16, S16: i16 => U32: u32,
        U32: u32 => S8: i8, S8: i8 => U32: u32,
        U16: u16 => S32: i32, S32: i32 => U16: u16,
        U16: u16 => S16: i16, S16: i16 => U16: u16,
        U16: u16 => S8: i8, S8: i8 => U16: u16,
        U8: u8 => S32: i32, S32: i32 => U8: u8,
        U8: u8 => S16: i16, S16: i16 => U8: u8,
        U8: u8 => S8: i8, S8: i8 => U8: u8,
    ]);
    table.extend(converter_table![2;
        CF64: f64 => CF32: f32, CF32: f32 => CF64: f64,
        CF32: f32 => CS32: i32, CS32: i32 => CF32: f32,
        CF32: f32 => CS16: i16, CS16: i16 => CF32: f32,
        CF32: f32 => CS8: i8, CS8: i8 => CF32: f32,
        CF32: f32 => CU32: u32, CU32: u32 => CF32: f32,
        CF32: f32 => CU16: u16, CU16: u16 => CF32: f32,
        CF32: f32 => CU8: u8, CU8: u8 => CF32: f32,
        CS32: i32 => CS16: i16, CS16: i16 => CS32: i32,
        CS32: i32 => CS8: i8, CS8: i8 => CS32: i32,
        CS16: i16 => CS8: i8, CS8: i8 => CS16: i16,
        CU32: u32 => CS32: i32, CS32: i32 => CU32: u32,
        CU32: u32 => CS16: i16, CS16: i16 => CU32: u32,
        CU32: u32 => CS8: i8, CS8: i8 => CU32: u32,
        CU16: u16 => CS32: i32, CS32: i32 => CU16: u16,
        CU16: u16 => CS16: i16, CS16: i16 => CU16: u16,
        CU16: u16 => CS8: i8, CS8: i8 => CU16: u16,
        CU8: u8 => CS32: i32, CS32: i32 => CU8: u8,
        CU8: u8 => CS16: i16, CS16: i16 => CU8: u8,
        CU8: u8 => CS8: i8, CS8: i8 => CU8: u8,
    ]);
    table
}
