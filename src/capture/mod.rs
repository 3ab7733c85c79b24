pub mod capture_loop;
pub mod device;
pub mod frame;
pub mod pacer;
pub mod pool;
pub mod v4l2;

#[cfg(test)]
pub(crate) mod testing;

pub use capture_loop::{CaptureLoop, CaptureStats, ChannelSink, FrameSink, LoopSettings, LoopState};
pub use device::{CaptureDevice, Dequeued, DeviceFormat};
pub use frame::{Frame, FrameGeometry, FrameMetadata, FrameView, PixelFormat};
pub use pacer::FramePacer;
pub use pool::{BufferLease, BufferPool, SlotState};
pub use v4l2::V4l2Device;
