//! Conversion between hardware ticks and nanoseconds.
//!
//! A finite positive `f64` rate is exactly `m * 2^e` for an odd integer `m`,
//! so both conversions reduce to scaling an integer by an exact rational.
//! The product is formed in `i128` and rounded to nearest, ties to even,
//! the default rounding mode of extended-precision hardware. Only when
//! the reduced fraction does not fit (absurdly large or tiny rates) does the
//! conversion fall back to `f64`.
//!
//! For rates up to 1 GHz, `time_ns_to_ticks(ticks_to_time_ns(t, r), r) == t`
//! holds for every tick count whose time fits in an `i64`.

use crate::error::{SdrError, SdrResult};

const NS_PER_SEC: u128 = 1_000_000_000;

/// Convert a tick count at `rate_hz` into nanoseconds.
pub fn ticks_to_time_ns(ticks: i64, rate_hz: f64) -> SdrResult<i64> {
    validate_rate(rate_hz)?;
    let scaled = exact_rate(rate_hz).and_then(|(num, den)| {
        // ns = ticks * 1e9 * den / num
        let n = NS_PER_SEC.checked_mul(den)?;
        scale_rounded(ticks, n, num)
    });
    Ok(scaled.unwrap_or_else(|| round_f64(ticks as f64 * 1e9 / rate_hz)))
}

/// Convert nanoseconds into a tick count at `rate_hz`.
pub fn time_ns_to_ticks(time_ns: i64, rate_hz: f64) -> SdrResult<i64> {
    validate_rate(rate_hz)?;
    let scaled = exact_rate(rate_hz).and_then(|(num, den)| {
        // ticks = ns * num / (1e9 * den)
        let d = NS_PER_SEC.checked_mul(den)?;
        scale_rounded(time_ns, num, d)
    });
    Ok(scaled.unwrap_or_else(|| round_f64(time_ns as f64 * rate_hz / 1e9)))
}

/// Length of one tick in nanoseconds.
pub fn tick_period_ns(rate_hz: f64) -> SdrResult<f64> {
    validate_rate(rate_hz)?;
    Ok(1e9 / rate_hz)
}

fn validate_rate(rate_hz: f64) -> SdrResult<()> {
    if rate_hz.is_finite() && rate_hz > 0.0 {
        Ok(())
    } else {
        Err(SdrError::InvalidArgument(format!(
            "tick rate must be finite and positive, got {}",
            rate_hz
        )))
    }
}

/// Split a finite positive rate into an exact fraction `num / den`.
fn exact_rate(rate_hz: f64) -> Option<(u128, u128)> {
    let bits = rate_hz.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mut mantissa, mut exponent) = if biased == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1u64 << 52), biased - 1075)
    };
    if mantissa == 0 {
        return None;
    }
    let tz = mantissa.trailing_zeros();
    mantissa >>= tz;
    exponent += tz as i32;

    let mantissa = mantissa as u128;
    if exponent >= 0 {
        let shift = exponent as u32;
        if shift + (128 - mantissa.leading_zeros()) >= 127 {
            return None;
        }
        Some((mantissa << shift, 1))
    } else {
        let shift = exponent.unsigned_abs();
        if shift >= 127 {
            return None;
        }
        Some((mantissa, 1u128 << shift))
    }
}

/// `round(value * num / den)`, ties to even.
///
/// Returns `None` when the intermediate product does not fit in `i128`.
/// Results outside the `i64` range saturate.
fn scale_rounded(value: i64, num: u128, den: u128) -> Option<i64> {
    let g = gcd(num, den);
    let num = i128::try_from(num / g).ok()?;
    let den = i128::try_from(den / g).ok()?;
    let x = (value as i128).checked_mul(num)?;

    let mut q = x / den;
    let r = (x % den).abs();
    let half = r.cmp(&(den - r));
    if half.is_gt() || (half.is_eq() && q % 2 != 0) {
        q += x.signum();
    }
    Some(match i64::try_from(q) {
        Ok(q) => q,
        Err(_) if q > 0 => i64::MAX,
        Err(_) => i64::MIN,
    })
}

fn round_f64(value: f64) -> i64 {
    // `as` saturates at the i64 bounds and maps NaN to zero
    value.round_ties_even() as i64
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}
