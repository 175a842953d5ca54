//! # Direct Buffer Access
//!
//! Drivers that keep a pool of transfer buffers can loan them to the
//! application instead of copying through caller-owned slices. A loaned
//! buffer moves out of the driver's pool as a [`DirectBuffer`] and moves
//! back on release, so its memory (and the addresses reported by
//! [`Stream::direct_access_buffer_addrs`]) never changes.
//!
//! [`Stream::acquire_read_buffer`] and [`Stream::acquire_write_buffer`] wrap
//! the loan in a guard that returns the buffer when dropped:
//!
//! ```rust,ignore
//! let buf = rx.acquire_read_buffer(100_000)?;
//! if buf.result().is_ok() {
//!     process(buf.channel(0));
//! }
//! drop(buf); // back to the driver
//!
//! let mut buf = tx.acquire_write_buffer(100_000)?;
//! let n = fill(buf.channel_mut(0));
//! buf.submit(n, StreamFlags::NONE, 0)?;
//! ```
//!
//! Each guard borrows its stream mutably, so a stream has at most one
//! buffer on loan at a time.

use crate::device::StreamResult;
use crate::error::{SdrError, SdrResult};
use crate::flags::StreamFlags;
use crate::stream::Stream;

/// A driver-owned transfer buffer on loan to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectBuffer {
    /// Slot in the driver's pool
    pub index: usize,
    /// One byte buffer per stream channel
    pub buffs: Vec<Vec<u8>>,
    /// Valid elements for reads, room in elements for writes
    pub num_elems: usize,
    pub flags: StreamFlags,
    pub time_ns: i64,
}

impl DirectBuffer {
    /// Empty buffer of `num_elems` elements per channel.
    pub fn new(index: usize, channels: usize, num_elems: usize, elem_size: usize) -> Self {
        Self {
            index,
            buffs: vec![vec![0u8; num_elems * elem_size]; channels],
            num_elems,
            flags: StreamFlags::NONE,
            time_ns: 0,
        }
    }

    /// Start address of each channel buffer.
    pub fn addrs(&self) -> Vec<usize> {
        self.buffs.iter().map(|b| b.as_ptr() as usize).collect()
    }

    /// Transfer outcome for a filled receive buffer.
    pub fn read_result(&self) -> StreamResult {
        let result = StreamResult::ok(self.num_elems).with_flags(self.flags);
        StreamResult {
            time_ns: self.time_ns,
            ..result
        }
    }
}

/// Receive buffer on loan from the driver. Released on drop.
pub struct ReadBuffer<'a> {
    stream: &'a mut Stream,
    buffer: Option<DirectBuffer>,
    result: StreamResult,
}

impl<'a> ReadBuffer<'a> {
    pub(crate) fn new(stream: &'a mut Stream, buffer: Option<DirectBuffer>, result: StreamResult) -> Self {
        Self { stream, buffer, result }
    }

    /// Status, element count, flags and time of this buffer.
    pub fn result(&self) -> StreamResult {
        self.result
    }

    pub fn num_elems(&self) -> usize {
        self.result.num_elems
    }

    /// Pool slot, `None` when the acquire returned only a status.
    pub fn index(&self) -> Option<usize> {
        self.buffer.as_ref().map(|b| b.index)
    }

    /// Received bytes of one channel, in the stream's wire format.
    pub fn channel(&self, index: usize) -> &[u8] {
        let len = self.result.num_elems * self.stream.format().size();
        self.buffer
            .as_ref()
            .and_then(|b| b.buffs.get(index))
            .map(|b| &b[..len.min(b.len())])
            .unwrap_or_default()
    }

    /// Hand the buffer back to the driver.
    pub fn release(self) {}
}

impl Drop for ReadBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.stream
                .device()
                .release_read_buffer(self.stream.raw_handle(), buffer);
        }
    }
}

/// Transmit buffer on loan from the driver.
///
/// [`submit`](WriteBuffer::submit) sends the filled part. Dropping without
/// submitting returns the buffer unsent.
pub struct WriteBuffer<'a> {
    stream: &'a mut Stream,
    buffer: Option<DirectBuffer>,
    result: StreamResult,
}

impl<'a> WriteBuffer<'a> {
    pub(crate) fn new(stream: &'a mut Stream, acquired: Result<DirectBuffer, StreamResult>) -> Self {
        match acquired {
            Ok(buffer) => {
                let result = StreamResult::ok(buffer.num_elems);
                Self {
                    stream,
                    buffer: Some(buffer),
                    result,
                }
            }
            Err(result) => Self {
                stream,
                buffer: None,
                result,
            },
        }
    }

    /// Outcome of the acquire. `num_elems` is the room in the buffer.
    pub fn result(&self) -> StreamResult {
        self.result
    }

    /// Room in elements, 0 when the acquire failed.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.num_elems)
    }

    pub fn index(&self) -> Option<usize> {
        self.buffer.as_ref().map(|b| b.index)
    }

    /// Writable bytes of one channel, in the stream's wire format.
    pub fn channel_mut(&mut self, index: usize) -> &mut [u8] {
        self.buffer
            .as_mut()
            .and_then(|b| b.buffs.get_mut(index))
            .map(|b| b.as_mut_slice())
            .unwrap_or_default()
    }

    /// Send the first `num_elems` elements and return the buffer.
    ///
    /// Bounded bursts are honored as for [`Stream::write`]: the count is
    /// trimmed to what remains and the closing submit carries `END_BURST`.
    /// Without a buffer the acquire status is returned unchanged.
    pub fn submit(mut self, num_elems: usize, flags: StreamFlags, time_ns: i64) -> SdrResult<StreamResult> {
        let buffer = match self.buffer.take() {
            None => return Ok(self.result),
            Some(buffer) if num_elems > buffer.num_elems => {
                let capacity = buffer.num_elems;
                // returned unsent on drop
                self.buffer = Some(buffer);
                return Err(SdrError::InvalidArgument(format!(
                    "{} elements do not fit a buffer of {}",
                    num_elems, capacity
                )));
            }
            Some(buffer) => buffer,
        };
        let elems = self.stream.burst_limit(num_elems);
        let mut flags = flags;
        if self.stream.closes_burst(elems) {
            flags.insert(StreamFlags::END_BURST);
        }
        let handle = self.stream.raw_handle();
        let mut result = self
            .stream
            .device()
            .release_write_buffer(handle, buffer, elems, flags, time_ns);
        self.stream.finish_transfer(&mut result);
        Ok(result)
    }
}

impl Drop for WriteBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let handle = self.stream.raw_handle();
            let result = self
                .stream
                .device()
                .release_write_buffer(handle, buffer, 0, StreamFlags::NONE, 0);
            if !result.is_ok() {
                tracing::debug!(%handle, status = %result.status, "unsent write buffer returned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_layout() {
        let buf = DirectBuffer::new(3, 2, 16, 4);
        assert_eq!(buf.index, 3);
        assert_eq!(buf.buffs.len(), 2);
        assert!(buf.buffs.iter().all(|b| b.len() == 64));
        let addrs = buf.addrs();
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0], addrs[1]);
    }

    #[test]
    fn test_addresses_survive_moves() {
        let buf = DirectBuffer::new(0, 1, 8, 8);
        let before = buf.addrs();
        let pool = vec![Some(buf)];
        let moved = pool.into_iter().flatten().next().unwrap();
        assert_eq!(moved.addrs(), before);
    }

    #[test]
    fn test_read_result_carries_time() {
        let mut buf = DirectBuffer::new(0, 1, 8, 8);
        buf.flags = StreamFlags::HAS_TIME;
        buf.time_ns = 500;
        let r = buf.read_result();
        assert_eq!(r.num_elems, 8);
        assert_eq!(r.time(), Some(500));
    }
}
