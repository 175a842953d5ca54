//! # Streams
//!
//! A [`Stream`] is created by [`Device::setup_stream`](crate::Device::setup_stream)
//! and enforces the lifecycle
//!
//! ```text
//!            activate            deactivate
//! Configured ────────► Active ◄────────────► Inactive
//!     │                  │        activate       │
//!     └──────────────────┴───── close ───────────┴──► Closed
//! ```
//!
//! Reads and writes are only accepted while Active. Status queries are also
//! accepted while Inactive, so events queued before a deactivation (such as
//! the acknowledgement of a finished burst) can still be collected. A stream
//! activated with a non-zero element count runs a bounded burst and drops
//! back to Inactive once that many elements have been transferred.
//!
//! Dropping a stream deactivates and closes it if the caller did not.

use crate::buffer::{check_buffers, check_raw_buffers};
use crate::device::{Device, StreamHandle, StreamResult};
use crate::direct::{ReadBuffer, WriteBuffer};
use crate::error::{SdrError, SdrResult};
use crate::flags::StreamFlags;
use crate::format::{StreamFormat, StreamSample};
use crate::kwargs::Kwargs;
use crate::types::Direction;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Configured,
    Active,
    Inactive,
    Closed,
}

/// What a stream was set up with. Fixed for the life of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub direction: Direction,
    pub format: StreamFormat,
    /// Device channel indices, in buffer order
    pub channels: Vec<usize>,
    pub args: Kwargs,
}

pub struct Stream {
    device: Device,
    handle: StreamHandle,
    descriptor: StreamDescriptor,
    state: StreamState,
    /// Elements left in a bounded burst
    burst_remaining: Option<usize>,
}

impl Stream {
    pub(crate) fn new(device: Device, handle: StreamHandle, descriptor: StreamDescriptor) -> Self {
        Self {
            device,
            handle,
            descriptor,
            state: StreamState::Configured,
            burst_remaining: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn direction(&self) -> Direction {
        self.descriptor.direction
    }

    pub fn format(&self) -> StreamFormat {
        self.descriptor.format
    }

    pub fn channels(&self) -> &[usize] {
        &self.descriptor.channels
    }

    /// Driver handle, `None` once closed.
    pub fn handle(&self) -> Option<StreamHandle> {
        (self.state != StreamState::Closed).then_some(self.handle)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Maximum elements per read or write call.
    pub fn mtu(&self) -> SdrResult<usize> {
        self.ensure_open()?;
        Ok(self.device.stream_mtu(self.handle))
    }

    /// Start streaming.
    ///
    /// `time_ns` is only used with [`StreamFlags::HAS_TIME`]. A non-zero
    /// `num_elems` requests a bounded burst. If the driver refuses, its
    /// status is returned as [`SdrError::Status`] and the state is unchanged.
    pub fn activate(&mut self, flags: StreamFlags, time_ns: i64, num_elems: usize) -> SdrResult<()> {
        self.ensure_open()?;
        if self.state == StreamState::Active {
            return Err(SdrError::AlreadyActive);
        }
        self.device
            .activate_stream(self.handle, flags, time_ns, num_elems)
            .map_err(SdrError::Status)?;
        self.state = StreamState::Active;
        self.burst_remaining = (num_elems > 0).then_some(num_elems);
        tracing::debug!(handle = %self.handle, ?flags, num_elems, "stream activated");
        Ok(())
    }

    /// Stop streaming. Only valid while Active.
    pub fn deactivate(&mut self, flags: StreamFlags, time_ns: i64) -> SdrResult<()> {
        self.ensure_open()?;
        if self.state != StreamState::Active {
            return Err(SdrError::NotActive);
        }
        self.device
            .deactivate_stream(self.handle, flags, time_ns)
            .map_err(SdrError::Status)?;
        self.state = StreamState::Inactive;
        self.burst_remaining = None;
        tracing::debug!(handle = %self.handle, "stream deactivated");
        Ok(())
    }

    /// Release the driver stream and the claimed channels.
    ///
    /// An Active stream is deactivated first. Channels are released even if
    /// the driver reports an error while closing.
    pub fn close(&mut self) -> SdrResult<()> {
        if self.state == StreamState::Closed {
            return Err(SdrError::AlreadyClosed);
        }
        if self.state == StreamState::Active {
            if let Err(code) = self
                .device
                .deactivate_stream(self.handle, StreamFlags::NONE, 0)
            {
                tracing::warn!(handle = %self.handle, %code, "deactivate before close failed");
            }
        }
        let result = self.device.close_stream(self.handle);
        self.device
            .claims()
            .release(self.descriptor.direction, &self.descriptor.channels);
        self.state = StreamState::Closed;
        self.burst_remaining = None;
        tracing::debug!(handle = %self.handle, "stream closed");
        result
    }

    /// Read into one buffer per channel.
    ///
    /// Scalar element types are interleaved I/Q, complex element types hold
    /// one sample per slot. The returned `num_elems` may be less than the
    /// buffers hold; a `Timeout` status with zero elements means nothing
    /// arrived within `timeout_us`.
    pub fn read<T: StreamSample>(&mut self, buffs: &mut [&mut [T]], timeout_us: i64) -> SdrResult<StreamResult> {
        self.ensure_io(Direction::Rx)?;
        let elems = check_buffers::<T, _>(self.format(), self.channels().len(), &*buffs)?;
        let mut raw: Vec<&mut [u8]> = buffs
            .iter_mut()
            .map(|b| bytemuck::cast_slice_mut::<T, u8>(&mut **b))
            .collect();
        Ok(self.read_bytes(&mut raw, elems, timeout_us))
    }

    /// Write one buffer per channel.
    pub fn write<T: StreamSample>(
        &mut self,
        buffs: &[&[T]],
        flags: StreamFlags,
        time_ns: i64,
        timeout_us: i64,
    ) -> SdrResult<StreamResult> {
        self.ensure_io(Direction::Tx)?;
        let elems = check_buffers::<T, _>(self.format(), self.channels().len(), &*buffs)?;
        let raw: Vec<&[u8]> = buffs
            .iter()
            .map(|b| bytemuck::cast_slice::<T, u8>(b))
            .collect();
        Ok(self.write_bytes(&raw, elems, flags, time_ns, timeout_us))
    }

    /// Read raw bytes in the stream's wire format.
    ///
    /// Used for packed and real formats that have no typed element.
    pub fn read_raw(&mut self, buffs: &mut [&mut [u8]], timeout_us: i64) -> SdrResult<StreamResult> {
        self.ensure_io(Direction::Rx)?;
        let elems = check_raw_buffers(self.format(), self.channels().len(), &*buffs)?;
        Ok(self.read_bytes(buffs, elems, timeout_us))
    }

    pub fn write_raw(
        &mut self,
        buffs: &[&[u8]],
        flags: StreamFlags,
        time_ns: i64,
        timeout_us: i64,
    ) -> SdrResult<StreamResult> {
        self.ensure_io(Direction::Tx)?;
        let elems = check_raw_buffers(self.format(), self.channels().len(), &*buffs)?;
        Ok(self.write_bytes(buffs, elems, flags, time_ns, timeout_us))
    }

    /// Poll for asynchronous events such as underflows or burst acks.
    ///
    /// Valid while Active or Inactive. A Configured stream has never run and
    /// reports [`SdrError::NotActive`].
    pub fn read_status(&mut self, timeout_us: i64) -> SdrResult<StreamResult> {
        self.ensure_open()?;
        if self.state == StreamState::Configured {
            return Err(SdrError::NotActive);
        }
        Ok(self.device.read_stream_status(self.handle, timeout_us))
    }

    /// Number of driver buffers available for direct access, 0 if the
    /// driver has none.
    pub fn num_direct_access_buffers(&self) -> SdrResult<usize> {
        self.ensure_open()?;
        Ok(self.device.num_direct_access_buffers(self.handle))
    }

    /// Start address of each channel buffer in pool slot `index`.
    pub fn direct_access_buffer_addrs(&self, index: usize) -> SdrResult<Vec<usize>> {
        self.ensure_open()?;
        self.device
            .direct_access_buffer_addrs(self.handle, index)
            .map_err(SdrError::Status)
    }

    /// Borrow the next filled receive buffer from the driver.
    ///
    /// A status such as `Timeout` or `Overflow` yields a guard without data
    /// whose [`result`](ReadBuffer::result) carries the status. In a bounded
    /// burst, elements past the end of the burst are not exposed.
    pub fn acquire_read_buffer(&mut self, timeout_us: i64) -> SdrResult<ReadBuffer<'_>> {
        self.ensure_io(Direction::Rx)?;
        let (buffer, mut result) = match self.device.acquire_read_buffer(self.handle, timeout_us) {
            Ok(mut buffer) => {
                buffer.num_elems = self.burst_limit(buffer.num_elems);
                let result = buffer.read_result();
                (Some(buffer), result)
            }
            Err(result) => (None, result),
        };
        self.finish_transfer(&mut result);
        Ok(ReadBuffer::new(self, buffer, result))
    }

    /// Borrow an empty transmit buffer from the driver. Fill it and call
    /// [`WriteBuffer::submit`].
    pub fn acquire_write_buffer(&mut self, timeout_us: i64) -> SdrResult<WriteBuffer<'_>> {
        self.ensure_io(Direction::Tx)?;
        let acquired = self.device.acquire_write_buffer(self.handle, timeout_us);
        Ok(WriteBuffer::new(self, acquired))
    }

    pub(crate) fn raw_handle(&self) -> StreamHandle {
        self.handle
    }

    fn read_bytes(&mut self, buffs: &mut [&mut [u8]], elems: usize, timeout_us: i64) -> StreamResult {
        let elems = self.burst_limit(elems);
        let mut result = self.device.read_stream(self.handle, buffs, elems, timeout_us);
        self.finish_transfer(&mut result);
        result
    }

    fn write_bytes(
        &mut self,
        buffs: &[&[u8]],
        elems: usize,
        mut flags: StreamFlags,
        time_ns: i64,
        timeout_us: i64,
    ) -> StreamResult {
        // a burst only ends on a write the driver can take whole
        let elems = self.burst_limit(elems).min(self.device.stream_mtu(self.handle));
        if self.closes_burst(elems) {
            flags.insert(StreamFlags::END_BURST);
        }
        let mut result = self
            .device
            .write_stream(self.handle, buffs, elems, flags, time_ns, timeout_us);
        self.finish_transfer(&mut result);
        result
    }

    /// True when transferring `elems` completes the bounded burst.
    pub(crate) fn closes_burst(&self, elems: usize) -> bool {
        elems > 0 && self.burst_remaining == Some(elems)
    }

    pub(crate) fn burst_limit(&self, elems: usize) -> usize {
        match self.burst_remaining {
            Some(remaining) => elems.min(remaining),
            None => elems,
        }
    }

    /// Account a transfer against the burst and end it when exhausted.
    pub(crate) fn finish_transfer(&mut self, result: &mut StreamResult) {
        let Some(remaining) = self.burst_remaining else {
            return;
        };
        let remaining = remaining.saturating_sub(result.num_elems);
        if remaining > 0 {
            self.burst_remaining = Some(remaining);
            return;
        }
        result.flags.insert(StreamFlags::END_BURST);
        if let Err(code) = self
            .device
            .deactivate_stream(self.handle, StreamFlags::NONE, 0)
        {
            tracing::warn!(handle = %self.handle, %code, "deactivate after burst failed");
        }
        self.state = StreamState::Inactive;
        self.burst_remaining = None;
        tracing::debug!(handle = %self.handle, "burst complete");
    }

    fn ensure_open(&self) -> SdrResult<()> {
        if self.state == StreamState::Closed {
            Err(SdrError::StreamClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_io(&self, direction: Direction) -> SdrResult<()> {
        self.ensure_open()?;
        if self.direction() != direction {
            return Err(SdrError::WrongDirection(self.direction()));
        }
        if self.state != StreamState::Active {
            return Err(SdrError::NotActive);
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.state != StreamState::Closed {
            if let Err(e) = self.close() {
                tracing::warn!(handle = %self.handle, error = %e, "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
