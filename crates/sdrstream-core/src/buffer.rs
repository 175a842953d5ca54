//! Buffer validation for stream reads and writes.
//!
//! Checks run in a fixed order and the first failure wins, so a given
//! mistake is always reported the same way. Nothing reaches the driver
//! unless every check passes.

use crate::error::BufferError;
use crate::format::{StreamFormat, StreamSample};

/// Validate typed channel buffers and return the elements per channel.
///
/// Order: non-empty, channel count, element type against the stream
/// format, uniform length, even length for interleaved scalars.
pub fn check_buffers<T, B>(format: StreamFormat, channels: usize, buffs: &[B]) -> Result<usize, BufferError>
where
    T: StreamSample,
    B: AsRef<[T]>,
{
    let len = check_shape(channels, buffs.iter().map(|b| b.as_ref().len()), || {
        if T::FORMAT != format {
            Err(BufferError::FormatMismatch {
                format,
                element: T::FORMAT,
            })
        } else {
            Ok(())
        }
    })?;
    if T::SCALARS_PER_ELEMENT == 1 && len % 2 != 0 {
        return Err(BufferError::OddLength { len });
    }
    Ok(T::elements_in(len))
}

/// Validate raw byte buffers and return the elements per channel.
///
/// Any format is accepted; the last check is that each buffer holds a
/// whole number of elements.
pub fn check_raw_buffers<B>(format: StreamFormat, channels: usize, buffs: &[B]) -> Result<usize, BufferError>
where
    B: AsRef<[u8]>,
{
    let len = check_shape(channels, buffs.iter().map(|b| b.as_ref().len()), || Ok(()))?;
    let size = format.size().max(1);
    if len % size != 0 {
        return Err(BufferError::PartialElement { len, size });
    }
    Ok(len / size)
}

fn check_shape<I, F>(channels: usize, mut lens: I, check_type: F) -> Result<usize, BufferError>
where
    I: ExactSizeIterator<Item = usize>,
    F: FnOnce() -> Result<(), BufferError>,
{
    if lens.len() == 0 {
        return Err(BufferError::NoBuffers);
    }
    if lens.len() != channels {
        return Err(BufferError::ChannelCountMismatch {
            expected: channels,
            actual: lens.len(),
        });
    }
    check_type()?;
    let first = lens.next().unwrap_or(0);
    if lens.any(|l| l != first) {
        return Err(BufferError::LengthMismatch);
    }
    Ok(first)
}
