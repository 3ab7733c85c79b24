//! Capture device abstraction
//!
//! The buffer pool talks to the driver only through [`CaptureDevice`]. The
//! V4L2 implementation lives in [`super::v4l2`]; tests drive the pool with
//! scripted doubles.

use std::time::Duration;

use crate::capture::frame::{FrameGeometry, PixelFormat};
use crate::error::Result;

/// Format negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row as reported by the driver
    pub bytes_per_line: u32,
    /// Maximum bytes per captured image
    pub size_image: u32,
    /// Seconds per frame as a fraction, `None` if the driver did not report one
    pub frame_interval: Option<(u32, u32)>,
}

impl DeviceFormat {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height, self.format)
    }

    /// Frame interval as a duration, if the driver reported a usable one
    pub fn interval(&self) -> Option<Duration> {
        match self.frame_interval {
            Some((num, den)) if num > 0 && den > 0 => Some(Duration::from_secs_f64(num as f64 / den as f64)),
            _ => None,
        }
    }

    /// Bytes per row, never less than a tightly packed row
    pub fn stride(&self) -> usize {
        let tight = self.width as usize * self.format.bytes_per_pixel().unwrap_or(1);
        (self.bytes_per_line as usize).max(tight)
    }

    /// Bytes of one complete frame as the driver lays it out
    pub fn frame_len(&self) -> usize {
        match self.format.bytes_per_pixel() {
            Some(_) => self.stride() * self.height as usize,
            None => self.format.frame_size(self.width, self.height),
        }
    }
}

/// A buffer the driver handed back filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Option<Duration>,
}

/// Driver side of a streaming capture device.
///
/// Implementations report a driver with no data ready as
/// [`Error::TransientUnavailable`](crate::Error::TransientUnavailable) and any
/// other dequeue failure as [`Error::DeviceError`](crate::Error::DeviceError).
pub trait CaptureDevice {
    /// Process-side view of one mapped buffer
    type Memory: AsRef<[u8]>;

    /// Negotiated format
    fn format(&self) -> DeviceFormat;

    /// Ask the driver for `count` buffers, returns how many were granted
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Map buffer `index` into process memory
    fn map(&mut self, index: u32) -> Result<Self::Memory>;

    /// Release a mapping obtained from [`CaptureDevice::map`]
    fn unmap(&mut self, index: u32, memory: Self::Memory) -> Result<()> {
        let _ = index;
        drop(memory);
        Ok(())
    }

    /// Hand buffer `index` to the driver
    fn enqueue(&mut self, index: u32) -> Result<()>;

    /// Take the next filled buffer from the driver without blocking
    fn dequeue(&mut self) -> Result<Dequeued>;

    /// Block until a buffer is ready or `timeout` elapses, `Ok(false)` on timeout
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;
}
