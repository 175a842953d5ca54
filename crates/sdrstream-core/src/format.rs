//! Stream sample formats.
//!
//! Format tokens are short strings such as `CF32` or `CS16`. A leading `C`
//! marks an interleaved complex format, the letter that follows gives the
//! component type (`F` float, `S` signed, `U` unsigned) and the digits give
//! the bits per component.
//!
//! Element types map to formats at compile time through [`StreamSample`].
//! A buffer of `f32` scalars is interleaved CF32 (I, Q, I, Q, ...), a buffer
//! of `Complex<f32>` is also CF32 with one sample per slot.

use std::str::FromStr;

use num_complex::Complex;

use crate::error::{SdrError, SdrResult};

/// Canonical stream format tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamFormat {
    CF64,
    CF32,
    CS32,
    CU32,
    CS16,
    CU16,
    CS12,
    CU12,
    CS8,
    CU8,
    CS4,
    CU4,
    F64,
    F32,
    S32,
    U32,
    S16,
    U16,
    S8,
    U8,
}

impl StreamFormat {
    /// Every known format.
    pub const ALL: [StreamFormat; 20] = [
        StreamFormat::CF64,
        StreamFormat::CF32,
        StreamFormat::CS32,
        StreamFormat::CU32,
        StreamFormat::CS16,
        StreamFormat::CU16,
        StreamFormat::CS12,
        StreamFormat::CU12,
        StreamFormat::CS8,
        StreamFormat::CU8,
        StreamFormat::CS4,
        StreamFormat::CU4,
        StreamFormat::F64,
        StreamFormat::F32,
        StreamFormat::S32,
        StreamFormat::U32,
        StreamFormat::S16,
        StreamFormat::U16,
        StreamFormat::S8,
        StreamFormat::U8,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamFormat::CF64 => "CF64",
            StreamFormat::CF32 => "CF32",
            StreamFormat::CS32 => "CS32",
            StreamFormat::CU32 => "CU32",
            StreamFormat::CS16 => "CS16",
            StreamFormat::CU16 => "CU16",
            StreamFormat::CS12 => "CS12",
            StreamFormat::CU12 => "CU12",
            StreamFormat::CS8 => "CS8",
            StreamFormat::CU8 => "CU8",
            StreamFormat::CS4 => "CS4",
            StreamFormat::CU4 => "CU4",
            StreamFormat::F64 => "F64",
            StreamFormat::F32 => "F32",
            StreamFormat::S32 => "S32",
            StreamFormat::U32 => "U32",
            StreamFormat::S16 => "S16",
            StreamFormat::U16 => "U16",
            StreamFormat::S8 => "S8",
            StreamFormat::U8 => "U8",
        }
    }

    /// True for interleaved complex formats.
    pub fn is_complex(self) -> bool {
        self.as_str().starts_with('C')
    }

    /// Bits in one component (I or Q, or the single real value).
    pub fn bits_per_component(self) -> usize {
        token_bits(self.as_str())
    }

    /// Bytes in one element. Packed formats round down (CS12 is 3 bytes).
    pub fn size(self) -> usize {
        let bits = self.bits_per_component();
        let bits = if self.is_complex() { bits * 2 } else { bits };
        bits / 8
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamFormat {
    type Err = SdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| SdrError::UnknownFormat(s.to_string()))
    }
}

fn token_bits(token: &str) -> usize {
    token
        .chars()
        .filter_map(|c| c.to_digit(10))
        .map(|d| d as usize)
        .fold(0, |acc, d| acc * 10 + d)
}

/// Size in bytes of one element of the format named by `token`.
pub fn format_to_size(token: &str) -> SdrResult<usize> {
    token.parse::<StreamFormat>().map(StreamFormat::size)
}

/// Buffer element types that can be exchanged with a stream.
///
/// `SCALARS_PER_ELEMENT` is 1 for interleaved scalar buffers, where two
/// consecutive slots form one complex sample, and 2 for complex element
/// types that carry both components in one slot.
pub trait StreamSample: bytemuck::Pod + Send + Sync + 'static {
    const FORMAT: StreamFormat;
    const SCALARS_PER_ELEMENT: usize;

    /// Number of stream elements held by a buffer of `len` slots.
    #[inline]
    fn elements_in(len: usize) -> usize {
        if Self::SCALARS_PER_ELEMENT == 1 {
            len / 2
        } else {
            len
        }
    }

    /// Number of buffer slots needed for `elems` stream elements.
    #[inline]
    fn slots_for(elems: usize) -> usize {
        if Self::SCALARS_PER_ELEMENT == 1 {
            elems * 2
        } else {
            elems
        }
    }
}

macro_rules! impl_stream_sample {
    ($($scalar:ty => $fmt:ident),* $(,)?) => {
        $(
            impl StreamSample for $scalar {
                const FORMAT: StreamFormat = StreamFormat::$fmt;
                const SCALARS_PER_ELEMENT: usize = 1;
            }

            impl StreamSample for Complex<$scalar> {
                const FORMAT: StreamFormat = StreamFormat::$fmt;
                const SCALARS_PER_ELEMENT: usize = 2;
            }
        )*
    };
}

impl_stream_sample! {
    f64 => CF64,
    f32 => CF32,
    i32 => CS32,
    u32 => CU32,
    i16 => CS16,
    u16 => CU16,
    i8 => CS8,
    u8 => CU8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        let cases = [
            ("CF64", 16),
            ("CF32", 8),
            ("CS32", 8),
            ("CU32", 8),
            ("CS16", 4),
            ("CU16", 4),
            ("CS12", 3),
            ("CU12", 3),
            ("CS8", 2),
            ("CU8", 2),
            ("CS4", 1),
            ("CU4", 1),
            ("F64", 8),
            ("F32", 4),
            ("S32", 4),
            ("U32", 4),
            ("S16", 2),
            ("U16", 2),
            ("S8", 1),
            ("U8", 1),
        ];
        for (token, size) in cases {
            assert_eq!(format_to_size(token).unwrap(), size, "{}", token);
        }
    }

    #[test]
    fn test_unknown_format() {
        assert_eq!(
            format_to_size("CF33"),
            Err(SdrError::UnknownFormat("CF33".to_string()))
        );
        assert!("cf32".parse::<StreamFormat>().is_err());
    }

    #[test]
    fn test_format_roundtrip_tokens() {
        for f in StreamFormat::ALL {
            assert_eq!(f.to_string().parse::<StreamFormat>().unwrap(), f);
        }
    }

    #[test]
    fn test_complex_flag() {
        assert!(StreamFormat::CS12.is_complex());
        assert!(!StreamFormat::S16.is_complex());
        assert_eq!(StreamFormat::CS12.bits_per_component(), 12);
    }

    #[test]
    fn test_sample_mapping() {
        assert_eq!(<f32 as StreamSample>::FORMAT, StreamFormat::CF32);
        assert_eq!(<Complex<i16> as StreamSample>::FORMAT, StreamFormat::CS16);
        assert_eq!(<u8 as StreamSample>::FORMAT, StreamFormat::CU8);
        assert_eq!(<f32 as StreamSample>::elements_in(2048), 1024);
        assert_eq!(<Complex<f32> as StreamSample>::elements_in(1024), 1024);
        assert_eq!(<i8 as StreamSample>::slots_for(10), 20);
    }
}
